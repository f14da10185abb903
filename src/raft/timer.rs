use rand::Rng;
use std::time::Duration;

use crate::config::RaftConfig;

/// How often the election timer re-checks its deadline.
pub const ELECTION_TICK_INTERVAL: Duration = Duration::from_millis(10);

/// Draws a randomized election timeout from the configured range.
///
/// With `force_reelection` set, one third of draws collapse to the minimum
/// so that replicas time out together and contest elections more often.
pub fn election_timeout(config: &RaftConfig) -> Duration {
    let mut rng = rand::thread_rng();
    if config.force_reelection && rng.gen_range(0..3) == 0 {
        Duration::from_millis(config.election_timeout_min_ms)
    } else {
        Duration::from_millis(
            rng.gen_range(config.election_timeout_min_ms..=config.election_timeout_max_ms),
        )
    }
}
