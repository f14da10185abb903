use async_trait::async_trait;

use crate::error::Result;
use crate::raft::rpc::{AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply};
use crate::raft::state::Command;

/// Outbound RPC interface between cluster replicas.
///
/// The consensus module treats any error as "no reply received" and moves
/// on; the next heartbeat or election cycle retries. Timeouts are the
/// transport's responsibility, not the module's.
#[async_trait]
pub trait Transport<C: Command>: Send + Sync {
    /// Send a RequestVote RPC to the target replica.
    async fn request_vote(&self, peer_id: u64, args: RequestVoteArgs) -> Result<RequestVoteReply>;

    /// Send an AppendEntries RPC to the target replica.
    async fn append_entries(
        &self,
        peer_id: u64,
        args: AppendEntriesArgs<C>,
    ) -> Result<AppendEntriesReply>;
}
