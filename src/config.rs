/// Timing configuration for a replica.
///
/// The defaults match the canonical Raft paper timings: election timeouts
/// drawn uniformly from [150, 300] ms against a 50 ms leader heartbeat.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Diagnostic knob: when set, one third of election timeout draws are
    /// pinned to the minimum, provoking more contested elections.
    pub force_reelection: bool,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            force_reelection: false,
        }
    }
}

impl RaftConfig {
    pub fn with_election_timeout(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.election_timeout_min_ms = min_ms;
        self.election_timeout_max_ms = max_ms;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self
    }

    pub fn with_force_reelection(mut self, on: bool) -> Self {
        self.force_reelection = on;
        self
    }
}
