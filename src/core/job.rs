//! Job definitions and the executable action interface.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::core::{ActionError, RetryPolicy, SchedulerError, Trigger};
use crate::util::serde::{InvocationId, RunId};

/// Optional payload produced by a successful action.
pub type ActionOutput = Option<serde_json::Value>;

/// Result of a single action attempt.
pub type ActionResult = Result<ActionOutput, ActionError>;

/// Everything an action learns about the attempt it is running.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Unique id of this attempt.
    pub run_id: RunId,
    /// Id shared by all attempts of the same logical invocation.
    pub invocation_id: InvocationId,
    /// Owning job.
    pub job_id: String,
    /// 1 for the first attempt, incremented on each retry.
    pub attempt: u32,
    /// Fire time this invocation was scheduled for.
    pub scheduled_for: DateTime<Utc>,
    /// Cancelled when the job is unregistered, the scheduler shuts down or
    /// the run exceeds its timeout. Actions should observe it cooperatively.
    pub cancellation: CancellationToken,
}

impl RunContext {
    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await;
    }
}

/// The unit of work a job runs on each fire.
///
/// # Example
///
/// ```rust,ignore
/// use async_trait::async_trait;
/// use prometheus_scheduler::core::{ActionError, ActionResult, JobAction, RunContext};
///
/// struct Cleanup;
///
/// #[async_trait]
/// impl JobAction for Cleanup {
///     async fn run(&self, ctx: RunContext) -> ActionResult {
///         if ctx.is_cancelled() {
///             return Err(ActionError::transient("cancelled"));
///         }
///         Ok(None)
///     }
/// }
/// ```
#[async_trait]
pub trait JobAction: Send + Sync + 'static {
    /// Execute one attempt.
    async fn run(&self, ctx: RunContext) -> ActionResult;
}

struct FnAction<F>(F);

#[async_trait]
impl<F, Fut> JobAction for FnAction<F>
where
    F: Fn(RunContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ActionResult> + Send + 'static,
{
    async fn run(&self, ctx: RunContext) -> ActionResult {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as a [`JobAction`].
pub fn action_fn<F, Fut>(f: F) -> Arc<dyn JobAction>
where
    F: Fn(RunContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ActionResult> + Send + 'static,
{
    Arc::new(FnAction(f))
}

/// Immutable description of a schedulable job.
#[derive(Clone)]
pub struct JobDefinition {
    id: String,
    name: String,
    trigger: Trigger,
    action: Arc<dyn JobAction>,
    retry_policy: RetryPolicy,
    max_concurrent: usize,
    enabled: bool,
    timeout: Option<Duration>,
}

impl JobDefinition {
    /// Start building a definition.
    pub fn builder(
        id: impl Into<String>,
        trigger: Trigger,
        action: Arc<dyn JobAction>,
    ) -> JobDefinitionBuilder {
        let id = id.into();
        JobDefinitionBuilder {
            name: None,
            id,
            trigger,
            action,
            retry_policy: RetryPolicy::none(),
            max_concurrent: 1,
            enabled: true,
            timeout: None,
        }
    }

    /// Unique id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Trigger.
    pub const fn trigger(&self) -> &Trigger {
        &self.trigger
    }

    /// Action handle.
    pub fn action(&self) -> &Arc<dyn JobAction> {
        &self.action
    }

    /// Retry policy applied to failed attempts.
    pub const fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Maximum simultaneous in-flight runs.
    pub const fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Whether the job starts enabled.
    pub const fn enabled(&self) -> bool {
        self.enabled
    }

    /// Per-attempt deadline.
    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

impl fmt::Debug for JobDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDefinition")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("trigger", &self.trigger)
            .field("retry_policy", &self.retry_policy)
            .field("max_concurrent", &self.max_concurrent)
            .field("enabled", &self.enabled)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Builder for [`JobDefinition`].
pub struct JobDefinitionBuilder {
    id: String,
    name: Option<String>,
    trigger: Trigger,
    action: Arc<dyn JobAction>,
    retry_policy: RetryPolicy,
    max_concurrent: usize,
    enabled: bool,
    timeout: Option<Duration>,
}

impl JobDefinitionBuilder {
    /// Display name (defaults to the id).
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Retry policy (defaults to [`RetryPolicy::none`]).
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Maximum simultaneous in-flight runs (defaults to 1).
    #[must_use]
    pub const fn max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    /// Initial enabled flag (defaults to true).
    #[must_use]
    pub const fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Per-attempt deadline.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Validate and build.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Configuration` for an empty id, a zero
    /// concurrency limit or timeout, or an invalid trigger or retry policy.
    pub fn build(self) -> Result<JobDefinition, SchedulerError> {
        if self.id.trim().is_empty() {
            return Err(SchedulerError::Configuration("job id must not be empty".into()));
        }
        if self.max_concurrent == 0 {
            return Err(SchedulerError::Configuration(format!(
                "job `{}`: max_concurrent must be at least 1",
                self.id
            )));
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(SchedulerError::Configuration(format!(
                "job `{}`: timeout must be greater than zero",
                self.id
            )));
        }
        self.trigger
            .validate()
            .and_then(|()| self.retry_policy.validate())
            .map_err(|e| match e {
                SchedulerError::Configuration(msg) => {
                    SchedulerError::Configuration(format!("job `{}`: {msg}", self.id))
                }
                other => other,
            })?;

        Ok(JobDefinition {
            name: self.name.unwrap_or_else(|| self.id.clone()),
            id: self.id,
            trigger: self.trigger,
            action: self.action,
            retry_policy: self.retry_policy,
            max_concurrent: self.max_concurrent,
            enabled: self.enabled,
            timeout: self.timeout,
        })
    }
}
