//! Provider layer: the per-kind capability interface and its implementations.
//!
//! The engine only talks to [`ResourceProvider`]. Transport, credentials and
//! pagination belong to the implementations: [`InMemoryCloud`] here, and the
//! EC2-backed providers behind the `aws` feature.

mod discovery;
mod memory;
mod registry;
mod traits;

pub use discovery::{DiscoveryReport, LiveDiscovery};
pub use memory::{CallRecord, Fault, InMemoryCloud};
pub use registry::ProviderRegistry;
pub use traits::{
    CreateRequest, CreatedResource, DeleteRequest, ProviderOp, RemoteResource, ResolvedRefs, ResourceProvider,
    UpdateRequest,
};

#[cfg(test)]
pub use traits::MockResourceProvider;
