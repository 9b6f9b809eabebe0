// ============================================================================
// Strict linting
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![warn(dead_code)]                   // Unused code is flagged
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness
#![warn(unused_imports)]              // Unused imports are flagged
#![warn(unused_variables)]            // Unused variables are flagged
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(nonstandard_style)]           // Non-standard code style is forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # vpcforge
//!
//! Declarative, idempotent reconciliation of virtual network environments.
//!
//! ## Overview
//!
//! An environment (network, route tables, subnets, security groups, key
//! pairs, gateway endpoints, instance groups and load balancers) is described
//! in one YAML file. vpcforge turns it into a typed dependency graph, rebuilds
//! the live graph from ownership tags, and executes the difference in
//! dependency order with bounded concurrency.
//!
//! ## Architecture
//!
//! 1. **Desired graph**: built from `vpcforge.yaml` by [`graph::GraphBuilder`]
//! 2. **Live graph**: discovered from the control plane by [`provider::LiveDiscovery`]
//! 3. **Plan**: the ordered difference, from [`planner::DiffEngine`]
//! 4. **Execution**: [`planner::PlanExecutor`] with retries and cancellation
//!
//! There is no state file. A resource belongs to an environment because it
//! carries the environment's ownership tag.
//!
//! ## Modules
//!
//! - [`config`]: Schema parsing and validation
//! - [`graph`]: Resource kinds, nodes and ordering
//! - [`naming`]: Names and tags
//! - [`provider`]: Control plane interface, in-memory implementation, discovery
//! - [`planner`]: Diff, plan and execution
//! - [`reconciler`]: Run orchestration
//! - [`cli`]: Command-line interface
//! - `aws` (feature `aws`): EC2 and classic ELB providers
//!
//! ## Example
//!
//! ```yaml
//! environment: staging
//! network: { cidr: 10.0.0.0/16 }
//! route_tables:
//!   private: { routes: [[0.0.0.0/0, nat]] }
//! subnets:
//!   private-1: { size: 24, route_table: private }
//!   private-2: { size: 24, route_table: private }
//! ```

// ============================================================================
// Modules
// ============================================================================

#[cfg(feature = "aws")]
pub mod aws;
pub mod cli;
pub mod config;
pub mod error;
pub mod graph;
pub mod naming;
pub mod planner;
pub mod provider;
pub mod reconciler;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, EnvironmentConfig};
pub use error::{Result, VpcForgeError};
pub use graph::{GraphBuilder, LiveGraph, NodeKey, ResourceGraph, ResourceKind};
pub use naming::Naming;
pub use planner::{DeploymentPlan, DiffEngine, PlanExecutor};
pub use provider::{InMemoryCloud, ProviderRegistry, ResourceProvider};
pub use reconciler::{DriftReport, Reconciler, RunOutcome, RunReport};
