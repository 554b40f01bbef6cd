// Session configuration tree.

use std::time::Duration;

use reqwest::header::HeaderMap;

use crate::retry::RetryPolicy;

/// Default User-Agent, matching what a current desktop Chrome sends. Sites
/// serving segmented media frequently reject unknown agents.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// HTTP client settings shared by manifest and segment fetches.
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// User-Agent header sent on active fetches.
    pub user_agent: String,
    /// Extra default headers merged over the built-in set.
    pub headers: HeaderMap,
    /// Timeout for establishing a connection.
    pub connect_timeout: Duration,
    /// Whole-request deadline for a single fetch attempt.
    pub request_timeout: Duration,
    /// Maximum idle connections kept per host.
    pub pool_max_idle_per_host: usize,
    /// How long an idle pooled connection is kept around.
    pub pool_idle_timeout: Duration,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            headers: HeaderMap::new(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            pool_max_idle_per_host: 8,
            pool_idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Flow-capture settings.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Host / URL substrings restricting which exchanges are observed.
    /// Empty means everything the tap produces is in scope.
    pub scope: Vec<String>,
    /// Capacity of the bounded channel between the capture task and the
    /// session consumer.
    pub channel_capacity: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            scope: Vec::new(),
            channel_capacity: 64,
        }
    }
}

/// Download supervisor settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Parallel segment fetches.
    pub fetch_concurrency: usize,
    /// How long a manifest-declared segment may stay Pending before the
    /// supervisor fetches it actively. Passive capture usually delivers the
    /// payload first; zero means fetch immediately.
    pub passive_grace: Duration,
    /// Interval between sweeps of the index for overdue Pending segments.
    pub sweep_interval: Duration,
    /// Backoff policy for individual segment fetches.
    pub retry: RetryPolicy,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            fetch_concurrency: 4,
            passive_grace: Duration::from_secs(2),
            sweep_interval: Duration::from_millis(250),
            retry: RetryPolicy::default(),
        }
    }
}

/// Configuration for one recording session.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub net: NetConfig,
    pub capture: CaptureConfig,
    pub supervisor: SupervisorConfig,
    /// Quiet period after which the primary stream counts as stalled and a
    /// competing classification may be adopted.
    pub stall_quiet_period: Duration,
    /// Capacity of the session event channel.
    pub event_capacity: usize,
}

impl SessionConfig {
    /// Configuration for manifest-driven downloads where no passive segment
    /// delivery will ever happen: every declared segment is fetched actively
    /// and without grace delay.
    pub fn manifest_driven() -> Self {
        Self {
            supervisor: SupervisorConfig {
                passive_grace: Duration::ZERO,
                ..SupervisorConfig::default()
            },
            ..Self::default()
        }
    }

    pub(crate) fn normalized(mut self) -> Self {
        if self.supervisor.fetch_concurrency == 0 {
            self.supervisor.fetch_concurrency = 1;
        }
        if self.capture.channel_capacity == 0 {
            self.capture.channel_capacity = 1;
        }
        if self.event_capacity == 0 {
            self.event_capacity = 32;
        }
        if self.stall_quiet_period.is_zero() {
            self.stall_quiet_period = Duration::from_secs(10);
        }
        self
    }
}
