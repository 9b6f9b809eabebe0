//! Reconciler: one run against one environment.
//!
//! A run validates the schema, builds the desired graph, discovers the live
//! graph, plans, checks guardrails and executes. Identity comes from tags on
//! live resources, so nothing is persisted between runs. Concurrent runs
//! against the same environment are not coordinated and must be serialized
//! by the caller.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ConfigHasher, ConfigValidator, EnvironmentConfig};
use crate::error::{PlanError, ReconcileError, Result, VpcForgeError};
use crate::graph::{GraphBuilder, LiveGraph, NodeKey, ResourceGraph};
use crate::naming::Naming;
use crate::planner::{
    DeploymentPlan, DiffDetail, DiffEngine, DiffType, ExecutionResult, PlanExecutor, PlanMode, RetryPolicy,
};
use crate::provider::{DiscoveryReport, LiveDiscovery, ProviderRegistry};

/// Drives reconciliation runs for one environment.
#[derive(Debug)]
pub struct Reconciler<'a> {
    /// Environment configuration.
    config: &'a EnvironmentConfig,
    /// Providers by kind.
    registry: &'a ProviderRegistry,
    /// Naming scheme derived from the environment.
    naming: Naming,
    /// Graph fingerprinting.
    hasher: ConfigHasher,
    /// Diff engine.
    diff_engine: DiffEngine,
    /// Retry policy for discovery and execution.
    retry: RetryPolicy,
    /// Run-level cancellation.
    cancel: CancellationToken,
}

/// Everything needed to show or execute a plan.
#[derive(Debug)]
pub struct PreparedRun {
    /// Desired graph.
    pub desired: ResourceGraph,
    /// Discovery result the plan was built from.
    pub discovery: DiscoveryReport,
    /// The plan.
    pub plan: DeploymentPlan,
}

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every action succeeded.
    Success,
    /// Some actions failed or were skipped; unrelated branches completed.
    PartialFailure,
    /// A root failure made the rest of the plan unreachable.
    TotalFailure,
    /// The run was cancelled before every action started; nothing failed.
    Cancelled,
}

/// Result of an executed run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Unique run id, for correlating logs.
    pub run_id: String,
    /// Environment name.
    pub environment: String,
    /// Mode of the run.
    pub mode: PlanMode,
    /// Fingerprint of the desired graph.
    pub config_hash: String,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: DateTime<Utc>,
    /// Overall outcome.
    pub outcome: RunOutcome,
    /// Per-action results.
    pub execution: ExecutionResult,
    /// Kinds whose listing failed, with the error.
    pub unavailable: BTreeMap<String, String>,
}

/// Kind of difference found by a drift check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftStatus {
    /// Declared but not found.
    Missing,
    /// Found with different attributes.
    Changed,
    /// Owned but no longer declared.
    Unmanaged,
}

/// One drifted resource.
#[derive(Debug, Clone, Serialize)]
pub struct DriftEntry {
    /// Resource address.
    pub key: NodeKey,
    /// Kind of drift.
    pub status: DriftStatus,
    /// Attribute-level differences.
    pub details: Vec<DiffDetail>,
}

/// Report of drift detection.
#[derive(Debug, Clone, Serialize)]
pub struct DriftReport {
    /// Environment name.
    pub environment: String,
    /// Drifted resources.
    pub entries: Vec<DriftEntry>,
    /// Number of declared resources.
    pub declared: usize,
    /// Number of owned live resources.
    pub live: usize,
    /// Kinds whose listing failed.
    pub unavailable: Vec<String>,
}

/// One owned live resource.
#[derive(Debug, Clone, Serialize)]
pub struct StatusEntry {
    /// Resource address.
    pub key: NodeKey,
    /// Remote identifier.
    pub remote_id: String,
    /// Whether the schema still declares it.
    pub declared: bool,
}

/// Inventory of an environment.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// Environment name.
    pub environment: String,
    /// Owned resources, in kind order.
    pub resources: Vec<StatusEntry>,
    /// Owned resources without a name tag, by kind.
    pub untracked: BTreeMap<String, Vec<String>>,
    /// Kinds whose listing failed.
    pub unavailable: Vec<String>,
}

impl<'a> Reconciler<'a> {
    /// Creates a new reconciler.
    #[must_use]
    pub fn new(config: &'a EnvironmentConfig, registry: &'a ProviderRegistry, cancel: CancellationToken) -> Self {
        Self {
            config,
            registry,
            naming: Naming::new(&config.environment, &config.tags),
            hasher: ConfigHasher::new(),
            diff_engine: DiffEngine::new(),
            retry: RetryPolicy::from(&config.engine.retry),
            cancel,
        }
    }

    /// Overrides the retry policy from the configuration.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Naming scheme of this environment.
    #[must_use]
    pub const fn naming(&self) -> &Naming {
        &self.naming
    }

    /// Validates the schema and builds the desired graph.
    ///
    /// # Errors
    ///
    /// Returns a configuration error; nothing has touched the cloud yet.
    pub fn desired_graph(&self) -> Result<ResourceGraph> {
        let validation = ConfigValidator::new().validate(self.config)?;
        for warning in &validation.warnings {
            warn!("{warning}");
        }
        Ok(GraphBuilder::new(self.config).build()?)
    }

    /// Rebuilds the desired graph so that sized subnets keep the blocks
    /// they already hold.
    fn desired_against(&self, live: &LiveGraph) -> Result<ResourceGraph> {
        Ok(GraphBuilder::new(self.config)
            .with_existing_blocks(live.subnet_blocks())
            .build()?)
    }

    /// Discovers owned live resources.
    pub async fn discover(&self) -> DiscoveryReport {
        LiveDiscovery::new(self.registry, &self.naming, self.retry.clone(), self.cancel.clone())
            .discover()
            .await
    }

    /// Builds the plan for a mode without executing it.
    ///
    /// # Errors
    ///
    /// Returns a configuration error (including immutable attribute
    /// changes), or a discovery error when a pruning or destroying run
    /// cannot see every kind.
    pub async fn prepare(&self, mode: PlanMode) -> Result<PreparedRun> {
        let desired = self.desired_graph()?;
        for kind in desired.ordered().map(|n| n.key.kind) {
            self.registry.get(kind)?;
        }

        let discovery = self.discover().await;
        if mode != PlanMode::Apply
            && let Some((kind, error)) = discovery.unavailable.iter().next()
        {
            // Deleting without a full picture could remove a resource
            // before an unseen dependent.
            return Err(PlanError::DiscoveryFailed {
                kind: kind.to_string(),
                source: error.clone(),
            }
            .into());
        }
        for (kind, ids) in &discovery.untracked {
            warn!(%kind, ids = ?ids, "Owned resources without a usable name tag are left alone");
        }
        let desired = self.desired_against(&discovery.live)?;

        let config_hash = self.hasher.hash_graph(&desired);
        let mut plan = match mode {
            PlanMode::Destroy => DeploymentPlan::destroy(&discovery.live, &config_hash),
            PlanMode::Apply | PlanMode::ApplyPrune => {
                let prune = mode == PlanMode::ApplyPrune;
                let diff = self.diff_engine.compute_diff(&desired, &discovery.live, prune)?;
                info!(
                    creates = diff.creates,
                    updates = diff.updates,
                    deletes = diff.deletes,
                    unchanged = diff.unchanged,
                    "Computed diff"
                );
                DeploymentPlan::from_diff(
                    &diff,
                    &desired,
                    &discovery.live,
                    prune,
                    self.config.guardrails.as_ref(),
                    &config_hash,
                )
            }
        };
        plan.block_kinds(&discovery.unavailable);

        Ok(PreparedRun {
            desired,
            discovery,
            plan,
        })
    }

    /// Executes a prepared plan.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::Aborted`] if the plan violates guardrails.
    /// Node failures are not errors; they are reported in the outcome.
    pub async fn execute(&self, prepared: PreparedRun) -> Result<RunReport> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4().to_string();
        let PreparedRun {
            desired,
            discovery,
            plan,
        } = prepared;

        if !plan.passes_guardrails {
            return Err(ReconcileError::Aborted {
                reason: format!("plan violates guardrails: {}", plan.guardrail_violations.join("; ")),
            }
            .into());
        }

        info!(%run_id, environment = self.naming.environment(), mode = %plan.mode, "Starting run");

        let run_cancel = self.cancel.child_token();
        let timer = self.config.engine.timeout_secs.map(|secs| {
            let token = run_cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(secs)).await;
                warn!(timeout_secs = secs, "Run timed out, cancelling");
                token.cancel();
            })
        });

        let mut live: LiveGraph = discovery.live;
        let execution = PlanExecutor::new(self.registry, &self.naming, &desired, run_cancel)
            .with_retry(self.retry.clone())
            .with_max_concurrency(self.config.engine.max_concurrency)
            .execute(&plan, &mut live)
            .await;

        if let Some(timer) = timer {
            timer.abort();
        }

        let outcome = RunOutcome::from_execution(&execution);
        info!(%run_id, ?outcome, "Run finished");

        Ok(RunReport {
            run_id,
            environment: self.naming.environment().to_string(),
            mode: plan.mode,
            config_hash: plan.config_hash.clone(),
            started_at,
            finished_at: Utc::now(),
            outcome,
            execution,
            unavailable: discovery
                .unavailable
                .iter()
                .map(|(k, e)| (k.to_string(), e.to_string()))
                .collect(),
        })
    }

    /// Creates and updates resources; with `prune`, also deletes owned
    /// resources the schema no longer declares.
    ///
    /// # Errors
    ///
    /// See [`Self::prepare`] and [`Self::execute`].
    pub async fn apply(&self, prune: bool) -> Result<RunReport> {
        let mode = if prune { PlanMode::ApplyPrune } else { PlanMode::Apply };
        let prepared = self.prepare(mode).await?;
        self.execute(prepared).await
    }

    /// Deletes every owned resource in reverse dependency order.
    ///
    /// # Errors
    ///
    /// See [`Self::prepare`] and [`Self::execute`].
    pub async fn destroy(&self) -> Result<RunReport> {
        let prepared = self.prepare(PlanMode::Destroy).await?;
        self.execute(prepared).await
    }

    /// Checks for drift without applying changes.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the schema is invalid.
    pub async fn drift(&self) -> Result<DriftReport> {
        self.desired_graph()?;
        let discovery = self.discover().await;
        let desired = self.desired_against(&discovery.live)?;
        let diff = self.diff_engine.drift(&desired, &discovery.live, true);

        let entries = diff
            .diffs
            .into_iter()
            .filter_map(|d| {
                let status = match d.diff_type {
                    DiffType::Create => DriftStatus::Missing,
                    DiffType::Update => DriftStatus::Changed,
                    DiffType::Delete => DriftStatus::Unmanaged,
                    DiffType::NoChange => return None,
                };
                Some(DriftEntry {
                    key: d.key,
                    status,
                    details: d.details,
                })
            })
            .collect::<Vec<_>>();

        debug!(drifted = entries.len(), "Drift check complete");
        Ok(DriftReport {
            environment: self.naming.environment().to_string(),
            entries,
            declared: desired.len(),
            live: discovery.live.len(),
            unavailable: discovery.unavailable.keys().map(ToString::to_string).collect(),
        })
    }

    /// Lists every owned live resource.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the schema is invalid.
    pub async fn status(&self) -> Result<StatusReport> {
        let desired = self.desired_graph()?;
        let discovery = self.discover().await;

        Ok(StatusReport {
            environment: self.naming.environment().to_string(),
            resources: discovery
                .live
                .iter()
                .map(|r| StatusEntry {
                    key: r.key.clone(),
                    remote_id: r.remote_id.clone(),
                    declared: desired.get(&r.key).is_some(),
                })
                .collect(),
            untracked: discovery
                .untracked
                .iter()
                .map(|(k, ids)| (k.to_string(), ids.clone()))
                .collect(),
            unavailable: discovery.unavailable.keys().map(ToString::to_string).collect(),
        })
    }
}

impl RunOutcome {
    /// Classifies an execution result.
    #[must_use]
    pub const fn from_execution(execution: &ExecutionResult) -> Self {
        if execution.root_failure.is_some() {
            Self::TotalFailure
        } else if execution.failed > 0 || execution.skipped > 0 {
            Self::PartialFailure
        } else if execution.cancelled > 0 {
            Self::Cancelled
        } else {
            Self::Success
        }
    }

    /// Process exit status for this outcome.
    #[must_use]
    pub const fn exit_code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::PartialFailure => 3,
            Self::TotalFailure => 4,
            Self::Cancelled => 5,
        }
    }
}

impl VpcForgeError {
    /// Process exit status for a run that ended in an error.
    ///
    /// Configuration errors and guardrail aborts happen before anything
    /// is attempted and share one status.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) | Self::Reconcile(ReconcileError::Aborted { .. }) => 2,
            _ => 1,
        }
    }
}

impl DriftReport {
    /// Returns true if the state is converged (no drift).
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::PartialFailure => "partial failure",
            Self::TotalFailure => "total failure",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl fmt::Display for DriftStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Missing => "missing",
            Self::Changed => "changed",
            Self::Unmanaged => "unmanaged",
        };
        f.write_str(s)
    }
}

impl fmt::Display for DriftReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_converged() {
            return write!(f, "No drift detected - state is converged");
        }
        writeln!(f, "Drift detected:")?;
        for entry in &self.entries {
            writeln!(f, "  - {} ({})", entry.key, entry.status)?;
            for detail in &entry.details {
                let marker = if detail.mutable { "" } else { " [immutable]" };
                writeln!(
                    f,
                    "      {}: {} -> {}{marker}",
                    detail.field,
                    detail.old_value.as_deref().unwrap_or("-"),
                    detail.new_value.as_deref().unwrap_or("-")
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::error::{ConfigError, ProviderError};
    use crate::graph::ResourceKind;
    use crate::planner::{ActionType, NodeOutcome};
    use crate::provider::{InMemoryCloud, ProviderOp};

    const SCENARIO: &str = r"
environment: staging
network: { cidr: 10.0.0.0/16 }
route_tables:
  private: { routes: [[0.0.0.0/0, nat]] }
subnets:
  private-1: { size: 24, route_table: private }
  private-2: { size: 24, route_table: private }
";

    const STACK: &str = r"
environment: staging
network: { cidr: 10.0.0.0/16 }
subnets:
  app: { size: 24 }
security_groups:
  web: { inbound: [[0.0.0.0/0, tcp, 443], [bastion, tcp, 22]] }
  bastion: { inbound: [[203.0.113.0/24, tcp, 22]] }
key_pairs: [deploy]
instance_groups:
  web: { ami: ami-123, instance_type: t3.small, count: 2, subnets: [app], security_groups: [web], key_pair: deploy }
";

    fn config(yaml: &str) -> EnvironmentConfig {
        ConfigParser::new().parse_yaml(yaml, None).unwrap()
    }

    fn reconciler<'a>(config: &'a EnvironmentConfig, registry: &'a ProviderRegistry) -> Reconciler<'a> {
        Reconciler::new(config, registry, CancellationToken::new()).with_retry(RetryPolicy::immediate(3))
    }

    #[tokio::test]
    async fn test_scenario_apply_then_noop() {
        let cloud = InMemoryCloud::new();
        let registry = cloud.registry();
        let config = config(SCENARIO);
        let reconciler = reconciler(&config, &registry);

        let first = reconciler.apply(false).await.unwrap();
        assert_eq!(first.outcome, RunOutcome::Success);
        assert_eq!(first.execution.successful, 4);
        assert!(first.execution.results.iter().all(|r| r.action_type == ActionType::Create));
        assert_eq!(cloud.len(), 4);

        let before = cloud.mutations().len();
        let second = reconciler.prepare(PlanMode::Apply).await.unwrap();
        assert_eq!(second.plan.action_count(), 4);
        assert!(second.plan.is_converged());

        let report = reconciler.execute(second).await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Success);
        assert_eq!(cloud.mutations().len(), before);
    }

    #[tokio::test]
    async fn test_growing_schema_keeps_sized_blocks() {
        let cloud = InMemoryCloud::new();
        let registry = cloud.registry();
        let small = config(
            r"
environment: staging
network: { cidr: 10.0.0.0/16 }
subnets:
  web: { size: 24 }
",
        );
        let first = reconciler(&small, &registry).apply(false).await.unwrap();
        assert_eq!(first.outcome, RunOutcome::Success);

        // 'app' sorts before 'web' and would take its block on a fresh allocation.
        let grown = config(
            r"
environment: staging
network: { cidr: 10.0.0.0/16 }
subnets:
  app: { size: 24 }
  web: { size: 24 }
",
        );
        let second = reconciler(&grown, &registry).apply(false).await.unwrap();
        assert_eq!(second.outcome, RunOutcome::Success);
        let created: Vec<_> = second
            .execution
            .results
            .iter()
            .filter(|r| r.action_type == ActionType::Create)
            .map(|r| r.key.name.as_str())
            .collect();
        assert_eq!(created, vec!["app"]);

        let blocks = reconciler(&grown, &registry).discover().await.live.subnet_blocks();
        assert_eq!(blocks["web"].to_string(), "10.0.0.0/24");
        assert_eq!(blocks["app"].to_string(), "10.0.1.0/24");

        let third = reconciler(&grown, &registry).prepare(PlanMode::Apply).await.unwrap();
        assert!(third.plan.is_converged());
    }

    #[tokio::test]
    async fn test_cycle_rejected_before_any_call() {
        let cloud = InMemoryCloud::new();
        let registry = cloud.registry();
        let config = config(
            r"
environment: staging
route_tables:
  nat: { routes: [[0.0.0.0/0, 'instance_group:nat']] }
subnets:
  a: { size: 24, route_table: nat }
instance_groups:
  nat: { ami: ami-1, instance_type: t3.nano, subnets: [a] }
",
        );
        let err = reconciler(&config, &registry).apply(false).await.unwrap_err();
        assert!(matches!(err, VpcForgeError::Config(ConfigError::DependencyCycle { .. })));
        assert_eq!(err.exit_code(), 2);
        assert!(cloud.calls().is_empty());
    }

    #[tokio::test]
    async fn test_rule_reorder_is_noop() {
        let cloud = InMemoryCloud::new();
        let registry = cloud.registry();
        let original = config(STACK);
        reconciler(&original, &registry).apply(false).await.unwrap();

        let reordered = config(&STACK.replace(
            "[[0.0.0.0/0, tcp, 443], [bastion, tcp, 22]]",
            "[[bastion, tcp, 22], [0.0.0.0/0, tcp, 443]]",
        ));
        let prepared = reconciler(&reordered, &registry).prepare(PlanMode::Apply).await.unwrap();
        assert!(prepared.plan.is_converged());
    }

    #[tokio::test]
    async fn test_destroy_deletes_instances_before_groups() {
        let cloud = InMemoryCloud::new();
        let registry = cloud.registry();
        let config = config(STACK);
        let reconciler = reconciler(&config, &registry);
        reconciler.apply(false).await.unwrap();
        let applied = cloud.mutations().len();

        let report = reconciler.destroy().await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Success);
        assert!(cloud.is_empty());

        let deletes: Vec<_> = cloud.mutations().into_iter().skip(applied).collect();
        assert!(deletes.iter().all(|c| c.op == ProviderOp::Delete && c.ok));
        let position = |kind: ResourceKind, name: &str| {
            deletes
                .iter()
                .position(|c| c.kind == kind && c.name.as_deref() == Some(name))
                .unwrap()
        };
        assert!(position(ResourceKind::InstanceGroup, "web") < position(ResourceKind::SecurityGroup, "web"));
        assert!(position(ResourceKind::SecurityGroupRules, "web") < position(ResourceKind::SecurityGroup, "bastion"));
        assert!(position(ResourceKind::Subnet, "app") < position(ResourceKind::Network, "staging"));
    }

    #[tokio::test]
    async fn test_prune_gating() {
        let cloud = InMemoryCloud::new();
        let registry = cloud.registry();
        let full = config(SCENARIO);
        reconciler(&full, &registry).apply(false).await.unwrap();

        let shrunk = config(&SCENARIO.replace("  private-2: { size: 24, route_table: private }\n", ""));
        let report = reconciler(&shrunk, &registry).apply(false).await.unwrap();
        assert!(report.execution.results.iter().all(|r| r.action_type != ActionType::Delete));
        assert_eq!(cloud.resources(ResourceKind::Subnet).len(), 2);

        let pruned = reconciler(&shrunk, &registry).apply(true).await.unwrap();
        assert_eq!(pruned.outcome, RunOutcome::Success);
        assert_eq!(cloud.resources(ResourceKind::Subnet).len(), 1);
    }

    #[tokio::test]
    async fn test_partial_failure_outcome() {
        let cloud = InMemoryCloud::new();
        cloud.fail_always(
            ResourceKind::Subnet,
            "private-2",
            ProviderOp::Create,
            ProviderError::invalid("no capacity in zone"),
        );
        let registry = cloud.registry();
        let config = config(SCENARIO);

        let report = reconciler(&config, &registry).apply(false).await.unwrap();
        assert_eq!(report.outcome, RunOutcome::PartialFailure);
        assert_eq!(report.outcome.exit_code(), 3);

        let outcome = |kind, name| report.execution.get(&NodeKey::new(kind, name)).unwrap().outcome.clone();
        assert_eq!(outcome(ResourceKind::RouteTable, "private"), NodeOutcome::Succeeded);
        assert_eq!(outcome(ResourceKind::Subnet, "private-1"), NodeOutcome::Succeeded);
        assert!(matches!(outcome(ResourceKind::Subnet, "private-2"), NodeOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn test_network_failure_is_total() {
        let cloud = InMemoryCloud::new();
        cloud.fail_always(
            ResourceKind::Network,
            "staging",
            ProviderOp::Create,
            ProviderError::PermissionDenied {
                message: String::from("denied"),
            },
        );
        let registry = cloud.registry();
        let config = config(SCENARIO);

        let report = reconciler(&config, &registry).apply(false).await.unwrap();
        assert_eq!(report.outcome, RunOutcome::TotalFailure);
        assert_eq!(report.outcome.exit_code(), 4);
    }

    #[tokio::test]
    async fn test_guardrails_abort_before_mutation() {
        let cloud = InMemoryCloud::new();
        let registry = cloud.registry();
        let full = config(SCENARIO);
        reconciler(&full, &registry).apply(false).await.unwrap();
        let applied = cloud.mutations().len();

        let emptied = config(
            r"
environment: staging
network: { cidr: 10.0.0.0/16 }
route_tables:
  private: { routes: [[0.0.0.0/0, nat]] }
guardrails: { max_deletes: 1 }
",
        );
        let err = reconciler(&emptied, &registry).apply(true).await.unwrap_err();
        assert!(matches!(err, VpcForgeError::Reconcile(ReconcileError::Aborted { .. })));
        assert_eq!(err.exit_code(), 2);
        assert_eq!(cloud.mutations().len(), applied);

        // Without pruning nothing is deleted, so the cap does not apply.
        let report = reconciler(&emptied, &registry).apply(false).await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Success);
        assert_eq!(cloud.len(), 4);
    }

    #[tokio::test]
    async fn test_destroy_needs_complete_discovery() {
        let cloud = InMemoryCloud::new();
        let registry = cloud.registry();
        let config = config(SCENARIO);
        let reconciler = reconciler(&config, &registry);
        reconciler.apply(false).await.unwrap();

        cloud.fail_listing(ResourceKind::Subnet, ProviderError::rate_limited("throttled"));
        let err = reconciler.destroy().await.unwrap_err();
        assert!(matches!(err, VpcForgeError::Plan(PlanError::DiscoveryFailed { .. })));
        assert_eq!(err.exit_code(), 1);
        assert_eq!(cloud.len(), 4);
    }

    #[tokio::test]
    async fn test_lagging_listing_adopts_instead_of_duplicating() {
        let cloud = InMemoryCloud::new();
        let registry = cloud.registry();
        let config = config(SCENARIO);
        let reconciler = reconciler(&config, &registry);

        cloud.hide_new_resources(1);
        reconciler.apply(false).await.unwrap();

        // The next listing misses everything, so the plan recreates it all.
        let report = reconciler.apply(false).await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Success);
        assert_eq!(cloud.len(), 4);
    }

    #[tokio::test]
    async fn test_environments_do_not_collide() {
        let cloud = InMemoryCloud::new();
        let registry = cloud.registry();
        let staging = config(SCENARIO);
        let production = config(&SCENARIO.replace("environment: staging", "environment: production"));

        reconciler(&staging, &registry).apply(false).await.unwrap();
        let report = reconciler(&production, &registry).apply(false).await.unwrap();
        assert_eq!(report.execution.successful, 4);
        assert_eq!(cloud.len(), 8);

        let status = reconciler(&staging, &registry).status().await.unwrap();
        assert_eq!(status.resources.len(), 4);
        assert!(status.resources.iter().all(|r| r.declared));
    }

    #[tokio::test]
    async fn test_drift_reports_changes() {
        let cloud = InMemoryCloud::new();
        let registry = cloud.registry();
        let original = config(STACK);
        reconciler(&original, &registry).apply(false).await.unwrap();

        let edited = config(&STACK.replace("count: 2", "count: 3"));
        let drift = reconciler(&edited, &registry).drift().await.unwrap();
        assert!(!drift.is_converged());
        assert_eq!(drift.entries.len(), 1);
        assert_eq!(drift.entries[0].status, DriftStatus::Changed);
        assert_eq!(drift.entries[0].details[0].field, "count");
    }
}
