use serde::{Deserialize, Serialize};

use crate::raft::state::LogEntry;

/// Arguments of the RequestVote RPC, sent by candidates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: i64,
    pub candidate_id: u64,
    pub last_log_index: i64,
    pub last_log_term: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: i64,
    pub vote_granted: bool,
}

/// Arguments of the AppendEntries RPC, sent by leaders. An empty `entries`
/// is a heartbeat; it still carries `leader_commit` forward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesArgs<C> {
    pub term: i64,
    pub leader_id: u64,
    /// Index of the entry immediately preceding `entries`, -1 for none.
    pub prev_log_index: i64,
    pub prev_log_term: i64,
    pub entries: Vec<LogEntry<C>>,
    pub leader_commit: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: i64,
    pub success: bool,
}
