//! Plan executor: dependency-ordered, bounded-concurrency execution.
//!
//! The coordinator loop owns the live graph and is its only writer. Each
//! provider call runs as a task in a [`JoinSet`] and is released only when
//! every action it depends on has succeeded. When an action fails, its
//! downstream actions are skipped and unrelated branches keep going. On
//! cancellation no new action is started; in-flight calls are drained.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::ProviderError;
use crate::graph::{EdgeKind, LiveGraph, LiveResource, NodeKey, ResourceGraph, ResourceKind};
use crate::naming::Naming;
use crate::provider::{
    CreateRequest, CreatedResource, DeleteRequest, ProviderRegistry, RemoteResource, ResolvedRefs, ResourceProvider,
    UpdateRequest,
};

use super::diff::compare;
use super::plan::{ActionType, DeploymentPlan, PlannedAction};
use super::retry::{RetryError, RetryPolicy};

/// Executor for deployment plans.
#[derive(Debug)]
pub struct PlanExecutor<'a> {
    /// Providers by kind.
    registry: &'a ProviderRegistry,
    /// Naming scheme for tags and provider names.
    naming: &'a Naming,
    /// Desired graph; source of create and update attributes.
    desired: &'a ResourceGraph,
    /// Retry policy for every provider call.
    retry: RetryPolicy,
    /// Maximum in-flight provider calls.
    max_concurrency: usize,
    /// Run-level cancellation.
    cancel: CancellationToken,
}

/// Terminal state of one action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NodeOutcome {
    /// The action reached its goal (noops included).
    Succeeded,
    /// The provider call failed permanently or exhausted its retries.
    Failed {
        /// Last provider error, rendered.
        error: String,
    },
    /// Not attempted because an upstream action did not succeed.
    Skipped {
        /// The action that failed first upstream.
        cause: String,
    },
    /// Not started before the run was cancelled.
    Cancelled,
}

/// Result of executing a single action.
#[derive(Debug, Clone, Serialize)]
pub struct ActionResult {
    /// Action index.
    pub index: usize,
    /// Resource address.
    pub key: NodeKey,
    /// What was attempted.
    pub action_type: ActionType,
    /// How it ended.
    pub outcome: NodeOutcome,
    /// Provider attempts made.
    pub attempts: u32,
    /// Remote id after the action (if any).
    pub remote_id: Option<String>,
    /// Wall-clock start.
    pub started_at: Option<DateTime<Utc>>,
    /// Wall-clock completion.
    pub finished_at: Option<DateTime<Utc>>,
    /// Monotonic start sequence number.
    pub start_seq: Option<u64>,
    /// Monotonic completion sequence number.
    pub finish_seq: Option<u64>,
}

/// Result of executing the entire plan.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    /// Individual action results, in plan order.
    pub results: Vec<ActionResult>,
    /// Number of successful actions.
    pub successful: usize,
    /// Number of failed actions.
    pub failed: usize,
    /// Number of skipped actions (due to dependency failures).
    pub skipped: usize,
    /// Number of actions cancelled before start.
    pub cancelled: usize,
    /// Failed action that made the rest of the plan unreachable.
    pub root_failure: Option<NodeKey>,
}

impl ExecutionResult {
    /// Returns true if every action succeeded.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.failed == 0 && self.skipped == 0 && self.cancelled == 0
    }

    /// Result for one resource.
    #[must_use]
    pub fn get(&self, key: &NodeKey) -> Option<&ActionResult> {
        self.results.iter().find(|r| &r.key == key)
    }
}

/// Where an action stands while the plan runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Pending,
    Running,
    Done,
}

/// What a finished task brings back to the coordinator.
#[derive(Debug)]
enum Completed {
    Created(CreatedResource),
    Updated,
    Deleted,
}

type TaskOutput = (usize, Result<(Completed, u32), RetryError>);

/// A provider call ready to run.
enum Call {
    Create(CreateRequest),
    Update(UpdateRequest),
    Delete(DeleteRequest),
}

impl<'a> PlanExecutor<'a> {
    /// Creates a new plan executor.
    #[must_use]
    pub fn new(
        registry: &'a ProviderRegistry,
        naming: &'a Naming,
        desired: &'a ResourceGraph,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            naming,
            desired,
            retry: RetryPolicy::default(),
            max_concurrency: 8,
            cancel,
        }
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the in-flight limit (at least one).
    #[must_use]
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    /// Executes a deployment plan against the live graph.
    ///
    /// Never fails as a whole: every action ends with a [`NodeOutcome`],
    /// and the live graph reflects every call that succeeded.
    pub async fn execute(&self, plan: &DeploymentPlan, live: &mut LiveGraph) -> ExecutionResult {
        info!(
            actions = plan.actions.len(),
            max_concurrency = self.max_concurrency,
            "Executing plan"
        );

        let mut run = RunState::new(plan);
        let mut tasks: JoinSet<TaskOutput> = JoinSet::new();
        let mut cancelled = self.cancel.is_cancelled();

        loop {
            if !cancelled {
                self.schedule(plan, live, &mut run, &mut tasks);
            }
            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(Ok((index, result))) => self.complete(plan, live, &mut run, index, result),
                    Some(Err(e)) => error!(error = %e, "Action task aborted"),
                    None => break,
                },
                () = self.cancel.cancelled(), if !cancelled => {
                    warn!(in_flight = tasks.len(), "Run cancelled, draining in-flight actions");
                    cancelled = true;
                }
            }
        }

        run.finish(plan)
    }

    /// Starts every pending action whose dependencies have succeeded.
    ///
    /// Dependencies point backwards, so a single pass also settles chains
    /// of noops.
    fn schedule(&self, plan: &DeploymentPlan, live: &LiveGraph, run: &mut RunState, tasks: &mut JoinSet<TaskOutput>) {
        for (index, action) in plan.actions.iter().enumerate() {
            if tasks.len() >= self.max_concurrency {
                return;
            }
            if run.slots[index] != Slot::Pending || !run.dependencies_met(action) {
                continue;
            }

            run.start(index);

            if action.action_type == ActionType::Noop {
                run.settle(index, NodeOutcome::Succeeded, 0, action.remote_id.clone());
                continue;
            }
            if let Some(error) = &action.blocked {
                warn!(resource = %action.key, error = %error, "Live state unknown, not attempting");
                run.fail(plan, index, error, 0);
                continue;
            }

            let provider = match self.registry.get(action.key.kind) {
                Ok(provider) => provider,
                Err(e) => {
                    let error = ProviderError::Other {
                        code: String::from("MissingProvider"),
                        message: e.to_string(),
                    };
                    run.fail(plan, index, &error, 0);
                    continue;
                }
            };

            match self.prepare(action, live, provider.as_ref()) {
                Ok(call) => {
                    debug!(resource = %action.key, action = %action.action_type, "Starting action");
                    tasks.spawn(self.run_call(index, provider, call));
                }
                Err(error) => run.fail(plan, index, &error, 0),
            }
        }
    }

    /// Builds the provider request from the desired and live graphs.
    fn prepare(&self, action: &PlannedAction, live: &LiveGraph, provider: &dyn ResourceProvider) -> Result<Call, ProviderError> {
        let key = &action.key;
        let missing = |what: &str| ProviderError::Other {
            code: String::from("Internal"),
            message: format!("{what} for {key}"),
        };

        match action.action_type {
            ActionType::Create => {
                let node = self.desired.get(key).ok_or_else(|| missing("no desired attributes"))?;
                Ok(Call::Create(CreateRequest {
                    key: key.clone(),
                    name: self.naming.resource_name(key),
                    spec: node.spec.clone(),
                    tags: self.naming.tags_within(key, provider.tag_limit()),
                    refs: resolve_refs(live, node.dependencies(live.network())),
                }))
            }
            ActionType::Update => {
                let node = self.desired.get(key).ok_or_else(|| missing("no desired attributes"))?;
                let current = live.get(key).ok_or_else(|| missing("no live resource"))?;
                let mut deps = node.dependencies(live.network());
                deps.extend(current.dependencies(live.network()));
                Ok(Call::Update(UpdateRequest {
                    key: key.clone(),
                    remote_id: current.remote_id.clone(),
                    current: current.spec.clone(),
                    desired: node.spec.clone(),
                    changed: action.details.iter().map(|d| d.field.clone()).collect(),
                    refs: resolve_refs(live, deps),
                }))
            }
            ActionType::Delete => {
                let current = live.get(key).ok_or_else(|| missing("no live resource"))?;
                Ok(Call::Delete(DeleteRequest {
                    key: key.clone(),
                    remote_id: current.remote_id.clone(),
                    current: current.spec.clone(),
                    refs: resolve_refs(live, current.dependencies(live.network())),
                }))
            }
            ActionType::Noop => Err(missing("nothing to call")),
        }
    }

    /// The task body: one provider call under the retry policy.
    fn run_call(
        &self,
        index: usize,
        provider: Arc<dyn ResourceProvider>,
        call: Call,
    ) -> impl Future<Output = TaskOutput> + Send + 'static {
        let retry = self.retry.clone();
        let cancel = self.cancel.clone();
        let naming = self.naming.clone();

        async move {
            let result = match call {
                Call::Create(request) => {
                    let label = request.key.to_string();
                    retry
                        .run(&cancel, &label, |_| {
                            let provider = provider.clone();
                            let request = request.clone();
                            let naming = naming.clone();
                            async move {
                                match provider.create(&request).await {
                                    Ok(created) => Ok(Completed::Created(created)),
                                    // The listing may still lag behind the conflict.
                                    Err(ProviderError::AlreadyExists { message }) => {
                                        let adopted = adopt(provider.as_ref(), &naming, &request.key)
                                            .await?
                                            .ok_or(ProviderError::NotYetVisible { message })?;
                                        finish_adopted(provider.as_ref(), &request, adopted)
                                            .await
                                            .map(Completed::Created)
                                    }
                                    Err(e) => Err(e),
                                }
                            }
                        })
                        .await
                }
                Call::Update(request) => {
                    let label = request.key.to_string();
                    retry
                        .run(&cancel, &label, |_| {
                            let provider = provider.clone();
                            let request = request.clone();
                            async move {
                                match provider.update(&request).await {
                                    Ok(()) => Ok(Completed::Updated),
                                    // Listed a moment ago, so not visible yet rather than gone.
                                    Err(ProviderError::NotFound { message }) => {
                                        Err(ProviderError::NotYetVisible { message })
                                    }
                                    Err(e) => Err(e),
                                }
                            }
                        })
                        .await
                }
                Call::Delete(request) => {
                    let label = request.key.to_string();
                    retry
                        .run(&cancel, &label, |_| {
                            let provider = provider.clone();
                            let request = request.clone();
                            async move {
                                match provider.delete(&request).await {
                                    Ok(()) => Ok(Completed::Deleted),
                                    Err(e) if e.is_not_found() => {
                                        debug!(resource = %request.key, "Already gone");
                                        Ok(Completed::Deleted)
                                    }
                                    Err(e) => Err(e),
                                }
                            }
                        })
                        .await
                }
            };
            (index, result)
        }
    }

    /// Applies a finished task to the live graph and the run state.
    fn complete(
        &self,
        plan: &DeploymentPlan,
        live: &mut LiveGraph,
        run: &mut RunState,
        index: usize,
        result: Result<(Completed, u32), RetryError>,
    ) {
        let action = &plan.actions[index];
        match result {
            Ok((Completed::Created(created), attempts)) => {
                if !self.naming.owner_tag().matches(&created.tags) {
                    let error = ProviderError::Other {
                        code: String::from("MissingOwnerTag"),
                        message: format!("{} was created without its ownership tag", created.remote_id),
                    };
                    run.fail(plan, index, &error, attempts);
                    return;
                }
                let spec = self
                    .desired
                    .get(&action.key)
                    .map(|n| n.spec.clone())
                    .or_else(|| live.get(&action.key).map(|r| r.spec.clone()));
                if let Some(spec) = spec {
                    live.insert(LiveResource {
                        key: action.key.clone(),
                        remote_id: created.remote_id.clone(),
                        tags: created.tags,
                        spec,
                    });
                }
                info!(resource = %action.key, id = %created.remote_id, attempts, "Created");
                run.settle(index, NodeOutcome::Succeeded, attempts, Some(created.remote_id));
            }
            Ok((Completed::Updated, attempts)) => {
                let remote_id = live.remote_id(&action.key).map(str::to_string);
                if let (Some(node), Some(remote_id)) = (self.desired.get(&action.key), &remote_id) {
                    let tags = live.get(&action.key).map(|r| r.tags.clone()).unwrap_or_default();
                    live.insert(LiveResource {
                        key: action.key.clone(),
                        remote_id: remote_id.clone(),
                        tags,
                        spec: node.spec.clone(),
                    });
                }
                info!(resource = %action.key, attempts, "Updated");
                run.settle(index, NodeOutcome::Succeeded, attempts, remote_id);
            }
            Ok((Completed::Deleted, attempts)) => {
                live.remove(&action.key);
                info!(resource = %action.key, attempts, "Deleted");
                run.settle(index, NodeOutcome::Succeeded, attempts, None);
            }
            Err(RetryError::Cancelled { attempts, error }) => {
                warn!(resource = %action.key, attempts, error = %error, "Cancelled while backing off");
                run.settle(index, NodeOutcome::Cancelled, attempts, action.remote_id.clone());
            }
            Err(e) => {
                error!(
                    resource = %action.key,
                    action = %action.action_type,
                    attempts = e.attempts(),
                    error = %e.error(),
                    "Action failed"
                );
                run.fail(plan, index, e.error(), e.attempts());
            }
        }
    }
}

/// Finds an owned resource that a lagging listing missed.
///
/// A create that conflicts with a resource carrying this node's identity
/// tags means an earlier attempt created it; it is adopted instead of failing.
async fn adopt(
    provider: &dyn ResourceProvider,
    naming: &Naming,
    key: &NodeKey,
) -> Result<Option<RemoteResource>, ProviderError> {
    let listed = provider.list(&naming.owner_tag()).await?;
    Ok(listed.into_iter().find(|r| naming.identify(key.kind, &r.tags).as_ref() == Some(key)))
}

/// Brings an adopted resource in line with the create request.
///
/// The earlier attempt may have stopped between the create call and its
/// follow-up calls, so whatever the listing reports differently is applied
/// as an update before the node counts as created.
async fn finish_adopted(
    provider: &dyn ResourceProvider,
    request: &CreateRequest,
    adopted: RemoteResource,
) -> Result<CreatedResource, ProviderError> {
    info!(resource = %request.key, id = %adopted.remote_id, "Adopting resource created by an earlier attempt");
    let current = request.refs.to_logical(&adopted.spec);
    let details = compare(&current, &request.spec);

    if let Some(detail) = details.iter().find(|d| !d.mutable) {
        return Err(ProviderError::invalid(format!(
            "{} exists as {} with {} {} instead of {}",
            request.key,
            adopted.remote_id,
            detail.field,
            detail.old_value.as_deref().unwrap_or("-"),
            detail.new_value.as_deref().unwrap_or("-"),
        )));
    }

    if !details.is_empty() {
        let changed: Vec<String> = details.into_iter().map(|d| d.field).collect();
        info!(resource = %request.key, fields = ?changed, "Completing adopted resource");
        let update = UpdateRequest {
            key: request.key.clone(),
            remote_id: adopted.remote_id.clone(),
            current,
            desired: request.spec.clone(),
            changed,
            refs: request.refs.clone(),
        };
        provider.update(&update).await.map_err(|e| match e {
            ProviderError::NotFound { message } => ProviderError::NotYetVisible { message },
            other => other,
        })?;
    }

    Ok(CreatedResource {
        remote_id: adopted.remote_id,
        tags: adopted.tags,
    })
}

/// Remote ids of every dependency already present in the live graph.
fn resolve_refs(live: &LiveGraph, deps: Vec<(NodeKey, EdgeKind)>) -> ResolvedRefs {
    let mut refs = ResolvedRefs::new();
    for (dep, _) in deps {
        if let Some(id) = live.remote_id(&dep) {
            refs.insert(dep, id);
        }
    }
    refs
}

/// Bookkeeping for one execution.
struct RunState {
    slots: Vec<Slot>,
    results: Vec<ActionResult>,
    seq: u64,
}

impl RunState {
    fn new(plan: &DeploymentPlan) -> Self {
        let results = plan
            .actions
            .iter()
            .enumerate()
            .map(|(index, action)| ActionResult {
                index,
                key: action.key.clone(),
                action_type: action.action_type,
                outcome: NodeOutcome::Cancelled,
                attempts: 0,
                remote_id: action.remote_id.clone(),
                started_at: None,
                finished_at: None,
                start_seq: None,
                finish_seq: None,
            })
            .collect();
        Self {
            slots: vec![Slot::Pending; plan.actions.len()],
            results,
            seq: 0,
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn dependencies_met(&self, action: &PlannedAction) -> bool {
        action.dependencies.iter().all(|d| {
            self.slots.get(*d) == Some(&Slot::Done)
                && self.results.get(*d).is_some_and(|r| r.outcome == NodeOutcome::Succeeded)
        })
    }

    fn start(&mut self, index: usize) {
        let seq = self.next_seq();
        self.slots[index] = Slot::Running;
        let result = &mut self.results[index];
        result.started_at = Some(Utc::now());
        result.start_seq = Some(seq);
    }

    fn settle(&mut self, index: usize, outcome: NodeOutcome, attempts: u32, remote_id: Option<String>) {
        let seq = self.next_seq();
        self.slots[index] = Slot::Done;
        let result = &mut self.results[index];
        result.outcome = outcome;
        result.attempts = attempts;
        result.remote_id = remote_id;
        result.finished_at = Some(Utc::now());
        result.finish_seq = Some(seq);
    }

    /// Records a failure and skips everything downstream of it.
    fn fail(&mut self, plan: &DeploymentPlan, index: usize, error: &ProviderError, attempts: u32) {
        let remote_id = self.results[index].remote_id.clone();
        self.settle(
            index,
            NodeOutcome::Failed {
                error: error.to_string(),
            },
            attempts,
            remote_id,
        );

        let cause = plan.actions[index].key.to_string();
        for downstream in plan.downstream(index) {
            if self.slots[downstream] == Slot::Pending {
                debug!(resource = %plan.actions[downstream].key, %cause, "Skipping, upstream failed");
                self.slots[downstream] = Slot::Done;
                self.results[downstream].outcome = NodeOutcome::Skipped { cause: cause.clone() };
            }
        }
    }

    fn finish(mut self, plan: &DeploymentPlan) -> ExecutionResult {
        for (index, slot) in self.slots.iter().enumerate() {
            match slot {
                // Never started: stays Cancelled.
                Slot::Pending => {}
                Slot::Running => {
                    self.results[index].outcome = NodeOutcome::Failed {
                        error: String::from("action task aborted"),
                    };
                }
                Slot::Done => {}
            }
        }

        let count = |f: fn(&NodeOutcome) -> bool| self.results.iter().filter(|r| f(&r.outcome)).count();
        let successful = count(|o| matches!(o, NodeOutcome::Succeeded));
        let failed = count(|o| matches!(o, NodeOutcome::Failed { .. }));
        let skipped = count(|o| matches!(o, NodeOutcome::Skipped { .. }));
        let cancelled = count(|o| matches!(o, NodeOutcome::Cancelled));
        let root_failure = root_failure(plan, &self.results);

        info!(successful, failed, skipped, cancelled, "Plan execution finished");
        ExecutionResult {
            results: self.results,
            successful,
            failed,
            skipped,
            cancelled,
            root_failure,
        }
    }
}

/// A failure is a root failure when it hit the network on the way up, or
/// when everything else the plan meant to change sits downstream of it.
fn root_failure(plan: &DeploymentPlan, results: &[ActionResult]) -> Option<NodeKey> {
    let work: BTreeSet<usize> = plan
        .actions
        .iter()
        .enumerate()
        .filter(|(_, a)| a.action_type != ActionType::Noop)
        .map(|(i, _)| i)
        .collect();

    results
        .iter()
        .filter(|r| matches!(r.outcome, NodeOutcome::Failed { .. }))
        .find(|r| {
            let network_up = r.key.kind == ResourceKind::Network && r.action_type != ActionType::Delete;
            let downstream: BTreeSet<usize> = plan.downstream(r.index).into_iter().collect();
            let covers_rest = work.len() > 1 && work.iter().all(|i| *i == r.index || downstream.contains(i));
            network_up || covers_rest
        })
        .map(|r| r.key.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::graph::{GraphBuilder, KeyPairSpec, NetworkSpec, ResourceSpec};
    use crate::planner::DiffEngine;
    use crate::provider::{InMemoryCloud, MockResourceProvider, ProviderOp};
    use std::collections::BTreeMap;
    use std::time::Duration;

    const SCENARIO: &str = r"
environment: staging
network: { cidr: 10.0.0.0/16 }
route_tables:
  private: { routes: [[0.0.0.0/0, nat]] }
subnets:
  private-1: { size: 24, route_table: private }
  private-2: { size: 24, route_table: private }
";

    fn graph(yaml: &str) -> ResourceGraph {
        let config = ConfigParser::new().parse_yaml(yaml, None).unwrap();
        GraphBuilder::new(&config).build().unwrap()
    }

    fn apply_plan(desired: &ResourceGraph, live: &LiveGraph) -> DeploymentPlan {
        let diff = DiffEngine::new().compute_diff(desired, live, false).unwrap();
        DeploymentPlan::from_diff(&diff, desired, live, false, None, "hash")
    }

    fn naming() -> Naming {
        Naming::new("staging", &BTreeMap::new())
    }

    #[tokio::test]
    async fn test_scenario_creates_in_dependency_order() {
        let desired = graph(SCENARIO);
        let cloud = InMemoryCloud::new();
        cloud.set_latency(Duration::from_millis(5));
        let registry = cloud.registry();
        let naming = naming();
        let mut live = LiveGraph::new("staging");
        let plan = apply_plan(&desired, &live);

        let result = PlanExecutor::new(&registry, &naming, &desired, CancellationToken::new())
            .with_retry(RetryPolicy::immediate(3))
            .with_max_concurrency(4)
            .execute(&plan, &mut live)
            .await;

        assert!(result.success());
        assert_eq!(result.successful, 4);
        assert_eq!(live.len(), 4);
        assert!(result.root_failure.is_none());

        // Every action starts after all of its dependencies finished.
        for (i, action) in plan.actions.iter().enumerate() {
            for dep in &action.dependencies {
                assert!(result.results[i].start_seq > result.results[*dep].finish_seq);
                assert!(result.results[i].started_at >= result.results[*dep].finished_at);
            }
        }
    }

    #[tokio::test]
    async fn test_partial_failure_isolated() {
        let yaml = format!(
            "{SCENARIO}instance_groups:\n  app: {{ ami: ami-1, instance_type: t3.small, count: 1, subnets: [private-2] }}\n"
        );
        let desired = graph(&yaml);
        let cloud = InMemoryCloud::new();
        cloud.fail_always(
            ResourceKind::Subnet,
            "private-2",
            ProviderOp::Create,
            ProviderError::invalid("bad zone"),
        );
        let registry = cloud.registry();
        let naming = naming();
        let mut live = LiveGraph::new("staging");
        let plan = apply_plan(&desired, &live);

        let result = PlanExecutor::new(&registry, &naming, &desired, CancellationToken::new())
            .with_retry(RetryPolicy::immediate(3))
            .execute(&plan, &mut live)
            .await;

        let outcome = |kind, name| result.get(&NodeKey::new(kind, name)).unwrap().outcome.clone();
        assert_eq!(outcome(ResourceKind::RouteTable, "private"), NodeOutcome::Succeeded);
        assert_eq!(outcome(ResourceKind::Subnet, "private-1"), NodeOutcome::Succeeded);
        assert!(matches!(outcome(ResourceKind::Subnet, "private-2"), NodeOutcome::Failed { .. }));
        assert!(matches!(outcome(ResourceKind::InstanceGroup, "app"), NodeOutcome::Skipped { .. }));
        assert_eq!(result.failed, 1);
        assert_eq!(result.skipped, 1);
        assert!(result.root_failure.is_none());

        // Permanent error: a single attempt.
        let subnet = result.get(&NodeKey::new(ResourceKind::Subnet, "private-2")).unwrap();
        assert_eq!(subnet.attempts, 1);
    }

    #[tokio::test]
    async fn test_network_failure_is_root_failure() {
        let desired = graph(SCENARIO);
        let cloud = InMemoryCloud::new();
        cloud.fail_always(
            ResourceKind::Network,
            "staging",
            ProviderOp::Create,
            ProviderError::QuotaExceeded {
                message: String::from("vpc limit"),
            },
        );
        let registry = cloud.registry();
        let naming = naming();
        let mut live = LiveGraph::new("staging");
        let plan = apply_plan(&desired, &live);

        let result = PlanExecutor::new(&registry, &naming, &desired, CancellationToken::new())
            .with_retry(RetryPolicy::immediate(3))
            .execute(&plan, &mut live)
            .await;

        assert_eq!(result.failed, 1);
        assert_eq!(result.skipped, 3);
        assert_eq!(result.root_failure, Some(NodeKey::new(ResourceKind::Network, "staging")));
        assert!(cloud.mutations().iter().all(|c| c.kind == ResourceKind::Network));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let desired = graph(SCENARIO);
        let cloud = InMemoryCloud::new();
        cloud.fail_once(
            ResourceKind::RouteTable,
            "private",
            ProviderOp::Create,
            ProviderError::rate_limited("slow down"),
        );
        let registry = cloud.registry();
        let naming = naming();
        let mut live = LiveGraph::new("staging");
        let plan = apply_plan(&desired, &live);

        let result = PlanExecutor::new(&registry, &naming, &desired, CancellationToken::new())
            .with_retry(RetryPolicy::immediate(3))
            .execute(&plan, &mut live)
            .await;

        assert!(result.success());
        let route_table = result.get(&NodeKey::new(ResourceKind::RouteTable, "private")).unwrap();
        assert_eq!(route_table.attempts, 2);
    }

    fn network_spec(desired: &ResourceGraph) -> NetworkSpec {
        match &desired.get(&NodeKey::new(ResourceKind::Network, "staging")).unwrap().spec {
            ResourceSpec::Network(network) => network.clone(),
            other => panic!("unexpected spec {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_interrupted_create_is_completed_on_adoption() {
        let desired = graph(SCENARIO);
        let cloud = InMemoryCloud::new();
        let partial = NetworkSpec {
            internet_gateway: false,
            ..network_spec(&desired)
        };
        cloud.interrupt_create(
            ResourceKind::Network,
            "staging",
            ResourceSpec::Network(partial),
            ProviderError::rate_limited("throttled attaching gateway"),
        );
        let registry = cloud.registry();
        let naming = naming();
        let mut live = LiveGraph::new("staging");
        let plan = apply_plan(&desired, &live);

        let result = PlanExecutor::new(&registry, &naming, &desired, CancellationToken::new())
            .with_retry(RetryPolicy::immediate(3))
            .execute(&plan, &mut live)
            .await;

        assert!(result.success());
        let stored = cloud.resources(ResourceKind::Network);
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].spec, ResourceSpec::Network(network_spec(&desired)));

        let ops: Vec<ProviderOp> = cloud
            .mutations()
            .iter()
            .filter(|c| c.kind == ResourceKind::Network)
            .map(|c| c.op)
            .collect();
        assert_eq!(ops, vec![ProviderOp::Create, ProviderOp::Create, ProviderOp::Update]);
    }

    #[tokio::test]
    async fn test_adopted_resource_with_fixed_mismatch_fails() {
        let desired = graph(SCENARIO);
        let cloud = InMemoryCloud::new();
        let partial = NetworkSpec {
            tenancy: String::from("dedicated"),
            ..network_spec(&desired)
        };
        cloud.interrupt_create(
            ResourceKind::Network,
            "staging",
            ResourceSpec::Network(partial),
            ProviderError::rate_limited("throttled"),
        );
        let registry = cloud.registry();
        let naming = naming();
        let mut live = LiveGraph::new("staging");
        let plan = apply_plan(&desired, &live);

        let result = PlanExecutor::new(&registry, &naming, &desired, CancellationToken::new())
            .with_retry(RetryPolicy::immediate(3))
            .execute(&plan, &mut live)
            .await;

        assert_eq!(result.root_failure, Some(NodeKey::new(ResourceKind::Network, "staging")));
        assert!(live.is_empty());
        assert!(
            cloud
                .mutations()
                .iter()
                .all(|c| c.op != ProviderOp::Update)
        );
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let desired = graph(SCENARIO);
        let cloud = InMemoryCloud::new();
        let registry = cloud.registry();
        let naming = naming();
        let mut live = LiveGraph::new("staging");
        let plan = apply_plan(&desired, &live);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = PlanExecutor::new(&registry, &naming, &desired, cancel)
            .execute(&plan, &mut live)
            .await;

        assert_eq!(result.cancelled, 4);
        assert!(cloud.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_mid_run_drains_in_flight() {
        let desired = graph(SCENARIO);
        let cloud = InMemoryCloud::new();
        cloud.set_latency(Duration::from_millis(50));
        let registry = cloud.registry();
        let naming = naming();
        let mut live = LiveGraph::new("staging");
        let plan = apply_plan(&desired, &live);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let result = PlanExecutor::new(&registry, &naming, &desired, cancel)
            .execute(&plan, &mut live)
            .await;

        // The network create was in flight and finished; nothing else started.
        let network = result.get(&NodeKey::new(ResourceKind::Network, "staging")).unwrap();
        assert_eq!(network.outcome, NodeOutcome::Succeeded);
        assert_eq!(result.cancelled, 3);
        assert_eq!(live.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_not_found_counts_as_deleted() {
        let desired = graph("environment: staging\nnetwork: { cidr: 10.0.0.0/16 }\n");
        let mut live = LiveGraph::new("staging");
        live.insert(LiveResource {
            key: NodeKey::new(ResourceKind::KeyPair, "old"),
            remote_id: "key-1".into(),
            tags: BTreeMap::new(),
            spec: ResourceSpec::KeyPair(KeyPairSpec { public_key: None }),
        });

        let mut mock = MockResourceProvider::new();
        mock.expect_kind().return_const(ResourceKind::KeyPair);
        mock.expect_delete()
            .times(1)
            .returning(|_| Err(ProviderError::not_found("key-1")));
        let registry = ProviderRegistry::new().with(Arc::new(mock));
        let naming = naming();

        let plan = DeploymentPlan::destroy(&live, "hash");
        let result = PlanExecutor::new(&registry, &naming, &desired, CancellationToken::new())
            .with_retry(RetryPolicy::immediate(3))
            .execute(&plan, &mut live)
            .await;

        assert!(result.success());
        assert!(live.is_empty());
    }

    #[tokio::test]
    async fn test_created_without_owner_tag_fails() {
        let desired = graph("environment: staging\nnetwork: { cidr: 10.0.0.0/16 }\n");
        let mut mock = MockResourceProvider::new();
        mock.expect_kind().return_const(ResourceKind::Network);
        mock.expect_tag_limit().return_const(None);
        mock.expect_create().times(1).returning(|_| {
            Ok(CreatedResource {
                remote_id: "vpc-1".into(),
                tags: BTreeMap::new(),
            })
        });
        let registry = ProviderRegistry::new().with(Arc::new(mock));
        let naming = naming();
        let mut live = LiveGraph::new("staging");
        let plan = apply_plan(&desired, &live);

        let result = PlanExecutor::new(&registry, &naming, &desired, CancellationToken::new())
            .execute(&plan, &mut live)
            .await;

        assert_eq!(result.failed, 1);
        assert!(live.is_empty());
    }

    #[tokio::test]
    async fn test_blocked_action_is_not_attempted() {
        let desired = graph(SCENARIO);
        let cloud = InMemoryCloud::new();
        let registry = cloud.registry();
        let naming = naming();
        let mut live = LiveGraph::new("staging");
        let mut plan = apply_plan(&desired, &live);
        plan.block_kinds(&BTreeMap::from([(
            ResourceKind::RouteTable,
            ProviderError::rate_limited("throttled"),
        )]));

        let result = PlanExecutor::new(&registry, &naming, &desired, CancellationToken::new())
            .execute(&plan, &mut live)
            .await;

        assert_eq!(result.successful, 1);
        assert_eq!(result.failed, 1);
        assert_eq!(result.skipped, 2);
        assert!(
            cloud
                .mutations()
                .iter()
                .all(|c| c.kind != ResourceKind::RouteTable)
        );
    }
}
