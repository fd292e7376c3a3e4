//! MemberGroup controller
//!
//! [`reconcile`] runs one pass of the task pipeline (see [`tasks`]) against a
//! freshly observed group, writes the status back and maps the pass result to
//! a requeue [`Action`]. Failed passes are requeued by [`error_policy`] with
//! per-group exponential backoff.

mod client;
mod context;
mod leader;
mod status;
pub mod tasks;

use std::sync::Arc;
use std::time::Instant;

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::Client;
use tracing::{error, info, instrument, warn};

pub use client::{KubePlatformClient, PlatformClient};
#[cfg(test)]
pub use client::MockPlatformClient;
pub use context::{ReconcileContext, Revision};
pub use leader::{
    pre_delete_check, select_healthy_transferee, select_transfer_target, transfer_leader_away,
    PreDelete,
};
pub use status::{build_status, failed_status, write_status, CONDITION_READY, CONDITION_SYNCED};

use crate::backoff::FailureBackoff;
use crate::config::ControllerConfig;
use crate::crd::MemberGroup;
use crate::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use crate::member::{ClientRegistry, MemberControlFactory};
use crate::task::{TaskKind, TaskResult};
use crate::telemetry::Metrics;
use crate::Error;

/// Name the controller reports Events under
pub const CONTROLLER_NAME: &str = "regent-controller";

/// Shared dependencies of every reconciliation pass
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```ignore
/// let ctx = Context::builder(client, config).build()?;
/// ```
pub struct Context {
    /// Kubernetes operations (trait object for testability)
    pub platform: Arc<dyn PlatformClient>,
    /// Member control-plane clients, one per group
    pub members: Arc<dyn MemberControlFactory>,
    /// Kubernetes Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Controller instruments
    pub metrics: Metrics,
    /// Controller settings
    pub config: ControllerConfig,
    /// Consecutive-failure tracking for requeue backoff
    pub backoff: FailureBackoff,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client, config: ControllerConfig) -> ContextBuilder {
        ContextBuilder::new(client, config)
    }

    /// Assemble a context from explicit dependencies
    pub fn new(
        platform: Arc<dyn PlatformClient>,
        members: Arc<dyn MemberControlFactory>,
        events: Arc<dyn EventPublisher>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            platform,
            members,
            events,
            metrics: Metrics::global(),
            backoff: config.failure_backoff(),
            config,
        }
    }
}

/// Builder for [`Context`]
///
/// Every dependency defaults to its production implementation built from the
/// kube client and the config; the setters override them.
pub struct ContextBuilder {
    client: Client,
    config: ControllerConfig,
    platform: Option<Arc<dyn PlatformClient>>,
    members: Option<Arc<dyn MemberControlFactory>>,
    events: Option<Arc<dyn EventPublisher>>,
    metrics: Option<Metrics>,
}

impl ContextBuilder {
    fn new(client: Client, config: ControllerConfig) -> Self {
        Self {
            client,
            config,
            platform: None,
            members: None,
            events: None,
            metrics: None,
        }
    }

    /// Override the platform client
    pub fn platform(mut self, platform: Arc<dyn PlatformClient>) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Override the member control factory
    pub fn member_factory(mut self, members: Arc<dyn MemberControlFactory>) -> Self {
        self.members = Some(members);
        self
    }

    /// Override the Event publisher
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Override the instruments
    pub fn metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the Context
    ///
    /// Fails if the configured CA bundle cannot be read.
    pub fn build(self) -> Result<Context, Error> {
        let members = match self.members {
            Some(members) => members,
            None => Arc::new(ClientRegistry::new(self.config.clone())?),
        };
        let platform = self.platform.unwrap_or_else(|| {
            Arc::new(KubePlatformClient::new(
                self.client.clone(),
                self.config.field_manager.clone(),
            ))
        });
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(KubeEventPublisher::new(self.client.clone(), CONTROLLER_NAME)));

        let mut ctx = Context::new(platform, members, events, self.config);
        if let Some(metrics) = self.metrics {
            ctx.metrics = metrics;
        }
        Ok(ctx)
    }
}

/// What one reconciliation pass produced
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PassOutcome {
    /// Result of the pass: the first non-Complete task result, or Complete
    pub result: TaskResult,
    /// Task that produced a non-Complete result
    pub task: Option<String>,
    /// A pod was created, updated or deleted
    pub pod_mutated: bool,
}

impl PassOutcome {
    fn stopped(task: &str, result: TaskResult) -> Self {
        Self {
            result,
            task: Some(task.to_string()),
            pod_mutated: false,
        }
    }
}

/// Run the task pipeline once against `group` and write its status back
///
/// The status is written whatever the pipeline returned. A failed status write
/// turns an otherwise successful pass into a failed one so it is retried.
pub async fn reconcile_pass(group: Arc<MemberGroup>, ctx: Arc<Context>) -> PassOutcome {
    if group.metadata.deletion_timestamp.is_some() {
        info!("group is being deleted");
        ctx.members
            .forget(&group.namespace_or_default(), &group.group_name());
        return PassOutcome {
            result: TaskResult::complete("group is being deleted"),
            task: None,
            pod_mutated: false,
        };
    }

    if group.spec.paused {
        info!("reconciliation paused");
        return PassOutcome {
            result: TaskResult::complete("reconciliation paused"),
            task: None,
            pod_mutated: false,
        };
    }

    if let Err(e) = group.spec.validate() {
        warn!(error = %e, "group validation failed");
        ctx.events
            .publish(
                &kube::Resource::object_ref(group.as_ref(), &()),
                EventType::Warning,
                reasons::VALIDATION_FAILED,
                actions::RECONCILE,
                Some(e.to_string()),
            )
            .await;
        let status = failed_status(&group, &e.to_string());
        if let Err(write_err) = write_status(&ctx, &group, &status).await {
            warn!(error = %write_err, "failed to record validation failure");
        }
        return PassOutcome::stopped("Validate", TaskResult::fail(e.to_string()));
    }

    let members = match ctx.members.for_group(&group) {
        Ok(members) => members,
        Err(e) => {
            return PassOutcome::stopped(
                "LoadContext",
                TaskResult::fail(format!("can't create member control client: {e}")),
            )
        }
    };

    let mut rtx = ReconcileContext::new(group.clone(), members, ctx.config.pod_webhook);
    let report = tasks::build_pipeline(ctx.clone()).run(&mut rtx).await;
    let mut result = report.result();
    let mut task = report.stopped_at().map(str::to_string);

    let status = build_status(&rtx, &result);
    if let Err(e) = write_status(&ctx, &group, &status).await {
        if result.kind() == TaskKind::Fail {
            warn!(error = %e, "failed to write status of a failed pass");
        } else {
            result = TaskResult::fail(format!("can't write status: {e}"));
            task = Some("Status".to_string());
        }
    }

    PassOutcome {
        result,
        task,
        pod_mutated: rtx.pod_mutated,
    }
}

/// Reconcile a MemberGroup
///
/// Runs one pass bounded by the configured deadline. `Complete` requeues at
/// the resync interval (or the retry interval if a pod changed), `Wait` and
/// `Retry` at their own intervals, and `Fail` is returned as an error for
/// [`error_policy`].
#[instrument(skip(group, ctx), fields(group = %group.key()))]
pub async fn reconcile(group: Arc<MemberGroup>, ctx: Arc<Context>) -> Result<Action, Error> {
    let key = group.key();
    let started = Instant::now();
    let deadline = ctx.config.pass_deadline();

    let outcome = match tokio::time::timeout(deadline, reconcile_pass(group, ctx.clone())).await {
        Ok(outcome) => outcome,
        Err(_) => PassOutcome::stopped(
            "Reconcile",
            TaskResult::fail(format!("pass exceeded its {}s deadline", deadline.as_secs())),
        ),
    };
    ctx.metrics
        .record_pass(&key, outcome.result.kind(), started.elapsed().as_secs_f64());

    let requeue = match outcome.result.kind() {
        TaskKind::Complete if outcome.pod_mutated => ctx.config.retry_interval(),
        TaskKind::Complete => ctx.config.resync_interval(),
        TaskKind::Wait => ctx.config.wait_interval(),
        TaskKind::Retry => ctx.config.retry_interval(),
        TaskKind::Fail => {
            return Err(Error::TaskFailed {
                task: outcome.task.unwrap_or_else(|| "Reconcile".to_string()),
                reason: outcome.result.reason().to_string(),
            })
        }
    };
    ctx.backoff.reset(&key);
    info!(result = %outcome.result, requeue_secs = requeue.as_secs(), "pass finished");
    Ok(Action::requeue(requeue))
}

/// Requeue a failed group with exponential backoff
pub fn error_policy(group: Arc<MemberGroup>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = group.key();
    let delay = ctx.backoff.next_delay(&key);
    error!(
        ?error,
        group = %key,
        failures = ctx.backoff.failures(&key),
        delay_secs = delay.as_secs(),
        "reconciliation failed"
    );
    Action::requeue(delay)
}
