use std::time::Duration;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
pub struct SchedulerArgs {
    /// Root directory for the file-backed persistent store
    #[arg(long, env = "KESTREL_STORE_ROOT", default_value = "/var/lib/kestrel")]
    pub store_root: String,

    /// Offer batches queued ahead of the worker; 0 = unbounded
    #[arg(long, env = "KESTREL_OFFER_QUEUE_DEPTH", default_value_t = 100)]
    pub offer_queue_depth: usize,

    /// Refuse interval for offers the scheduler wants to see again soon, in seconds
    #[arg(long, env = "KESTREL_SHORT_REFUSE_SECS", default_value_t = 5)]
    pub short_refuse_secs: u64,

    /// Refuse interval for offers the scheduler has no use for, in seconds
    #[arg(long, env = "KESTREL_LONG_REFUSE_SECS", default_value_t = 1_209_600)]
    pub long_refuse_secs: u64,

    /// Initial delay between task reconciliation rounds, in seconds
    #[arg(long, env = "KESTREL_RECONCILE_BASE_SECS", default_value_t = 8)]
    pub reconcile_base_secs: u64,

    /// Ceiling on the reconciliation backoff, in seconds
    #[arg(long, env = "KESTREL_RECONCILE_CAP_SECS", default_value_t = 3600)]
    pub reconcile_cap_secs: u64,

    /// Initial delay before an unacknowledged kill is re-issued, in seconds
    #[arg(long, env = "KESTREL_KILL_RETRY_BASE_SECS", default_value_t = 5)]
    pub kill_retry_base_secs: u64,

    /// Offer evaluation outcomes retained for diagnostics
    #[arg(long, env = "KESTREL_OFFER_OUTCOME_CAPACITY", default_value_t = 100)]
    pub offer_outcome_capacity: usize,

    /// Port for the /metrics and health endpoint; unset disables it
    #[arg(long, env = "METRICS_PORT")]
    pub metrics_port: Option<u16>,
}

/// Resolved runtime tunables shared across the scheduler components.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub offer_queue_depth: usize,
    pub short_refuse: Duration,
    pub long_refuse: Duration,
    pub reconcile_base: Duration,
    pub reconcile_cap: Duration,
    pub kill_retry_base: Duration,
    pub offer_outcome_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            offer_queue_depth: 100,
            short_refuse: Duration::from_secs(5),
            long_refuse: Duration::from_secs(1_209_600),
            reconcile_base: Duration::from_secs(8),
            reconcile_cap: Duration::from_secs(3600),
            kill_retry_base: Duration::from_secs(5),
            offer_outcome_capacity: 100,
        }
    }
}

impl From<&SchedulerArgs> for SchedulerConfig {
    fn from(args: &SchedulerArgs) -> Self {
        SchedulerConfig {
            offer_queue_depth: args.offer_queue_depth,
            short_refuse: Duration::from_secs(args.short_refuse_secs),
            long_refuse: Duration::from_secs(args.long_refuse_secs),
            reconcile_base: Duration::from_secs(args.reconcile_base_secs),
            reconcile_cap: Duration::from_secs(args.reconcile_cap_secs),
            kill_retry_base: Duration::from_secs(args.kill_retry_base_secs),
            offer_outcome_capacity: args.offer_outcome_capacity,
        }
    }
}
