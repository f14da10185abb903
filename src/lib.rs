//! A Raft consensus core with pluggable collaborators.
//!
//! Each [`ConsensusModule`] is one replica in a fixed-size cluster. The RPC
//! transport between replicas, the durable storage backend, and the client
//! state machine consuming committed entries are supplied by the embedder
//! through the [`Transport`] and [`Storage`] traits and the commit channel.

pub mod config;
pub mod error;
pub mod raft;
pub mod storage;
pub mod transport;

pub use config::RaftConfig;
pub use error::{RaftError, Result};
pub use raft::node::ConsensusModule;
pub use raft::rpc::{AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply};
pub use raft::state::{Command, CommitEntry, LogEntry, Role};
pub use storage::{MemStorage, Storage};
pub use transport::Transport;
