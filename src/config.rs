use std::time::Duration;

const DEFAULT_CONFLICT_RETRIES: u32 = 3;
const DEFAULT_JOB_BACKOFF_BASE: Duration = Duration::from_secs(5);
const DEFAULT_MAX_ATTEMPTS: i32 = 3;
const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_JOB_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const MIN_JOB_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1);
const DEFAULT_SLA_ACK_WARNING: Duration = Duration::from_secs(5 * 60);
const DEFAULT_SLA_RESOLVE_WARNING: Duration = Duration::from_secs(15 * 60);
const DEFAULT_SLA_CHECK_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Tunables of the [`Engine`](crate::Engine).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub(crate) conflict_retries: u32,
    pub(crate) job_backoff_base: Duration,
    pub(crate) default_max_attempts: i32,
    pub(crate) dispatch_timeout: Duration,
    pub(crate) retry_failed_notifications: bool,
    pub(crate) immediate_first_step: bool,
    pub(crate) job_heartbeat_interval: Duration,
    pub(crate) sla_ack_warning: Duration,
    pub(crate) sla_resolve_warning: Duration,
    pub(crate) sla_check_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            conflict_retries: DEFAULT_CONFLICT_RETRIES,
            job_backoff_base: DEFAULT_JOB_BACKOFF_BASE,
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            dispatch_timeout: DEFAULT_DISPATCH_TIMEOUT,
            retry_failed_notifications: true,
            immediate_first_step: true,
            job_heartbeat_interval: DEFAULT_JOB_HEARTBEAT_INTERVAL,
            sla_ack_warning: DEFAULT_SLA_ACK_WARNING,
            sla_resolve_warning: DEFAULT_SLA_RESOLVE_WARNING,
            sla_check_interval: DEFAULT_SLA_CHECK_INTERVAL,
        }
    }
}

impl EngineConfig {
    /// Set how many times event intake retries after a write conflict
    /// before giving up with [`EventError::Conflict`](crate::EventError::Conflict).
    pub fn conflict_retries(mut self, retries: u32) -> Self {
        self.conflict_retries = retries;
        self
    }

    /// Set the base of the exponential retry backoff.
    ///
    /// A job failing its `n`-th attempt is retried after `base * 2^n`.
    pub fn job_backoff_base(mut self, base: Duration) -> Self {
        self.job_backoff_base = base;
        self
    }

    /// Set the attempts allowed for jobs scheduled by the engine itself.
    pub fn default_max_attempts(mut self, max_attempts: i32) -> Self {
        self.default_max_attempts = max_attempts.max(1);
        self
    }

    /// Set the upper bound on a single notification dispatch.
    pub fn dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch_timeout = timeout;
        self
    }

    /// Set whether failed dispatches are retried through a `NOTIFICATION` job.
    pub fn retry_failed_notifications(mut self, retry: bool) -> Self {
        self.retry_failed_notifications = retry;
        self
    }

    /// Set whether a zero-delay first escalation step runs as part of event intake.
    ///
    /// The step-0 job is written either way; when this is disabled, only a
    /// worker will pick it up.
    pub fn immediate_first_step(mut self, immediate: bool) -> Self {
        self.immediate_first_step = immediate;
        self
    }

    /// Set how often a running job renews its claim.
    ///
    /// Keep it well below the runner's stale-job timeout.
    pub fn job_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.job_heartbeat_interval = interval.max(MIN_JOB_HEARTBEAT_INTERVAL);
        self
    }

    /// Set how long before an acknowledgement breach a warning is raised.
    pub fn sla_ack_warning(mut self, lead_time: Duration) -> Self {
        self.sla_ack_warning = lead_time;
        self
    }

    /// Set how long before a resolution breach a warning is raised.
    pub fn sla_resolve_warning(mut self, lead_time: Duration) -> Self {
        self.sla_resolve_warning = lead_time;
        self
    }

    /// Set the period of the recurring SLA breach check.
    pub fn sla_check_interval(mut self, interval: Duration) -> Self {
        self.sla_check_interval = interval;
        self
    }
}
