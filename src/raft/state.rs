use std::collections::HashMap;
use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Replica role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
    Dead,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Candidate => write!(f, "candidate"),
            Role::Leader => write!(f, "leader"),
            Role::Dead => write!(f, "dead"),
        }
    }
}

/// Marker trait for the opaque client command carried in log entries.
///
/// The module never inspects commands; it only replicates, persists, and
/// delivers them. Blanket-implemented for any type that is cloneable,
/// printable, and serde-serializable.
pub trait Command:
    Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

impl<T> Command for T where T: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A single entry in the replicated log.
///
/// Entry positions are 0-based; an index of -1 means "no entry".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry<C> {
    pub command: C,
    pub term: i64,
}

/// Reported on the commit channel once consensus is reached on an entry
/// and the client may apply it to its state machine.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitEntry<C> {
    pub command: C,
    pub index: i64,
    pub term: i64,
}

/// The complete per-replica state record, guarded by a single mutex inside
/// the consensus module. All fields are read and written under that mutex.
#[derive(Debug)]
pub struct RaftState<C> {
    pub role: Role,

    // Persistent state, survives restarts via the storage collaborator.
    pub current_term: i64,
    pub voted_for: Option<u64>,
    pub log: Vec<LogEntry<C>>,

    // Volatile state.
    pub commit_index: i64,
    pub last_applied: i64,
    /// Instant of the most recent legitimate leader contact or vote cast.
    pub election_reset: Instant,

    // Volatile leader state, reinitialized on every election win.
    pub next_index: HashMap<u64, i64>,
    pub match_index: HashMap<u64, i64>,

    /// Wakes the commit-delivery task. Taken (and thereby closed) on stop.
    pub commit_ready_tx: Option<mpsc::Sender<()>>,
    /// Wakes the leader's append loop. One channel per leader epoch.
    pub trigger_tx: Option<mpsc::Sender<()>>,
}

impl<C: Command> RaftState<C> {
    pub fn new() -> Self {
        Self {
            role: Role::Follower,
            current_term: 0,
            voted_for: None,
            log: Vec::new(),
            commit_index: -1,
            last_applied: -1,
            election_reset: Instant::now(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            commit_ready_tx: None,
            trigger_tx: None,
        }
    }

    /// Index and term of the last log entry, or (-1, -1) for an empty log.
    pub fn last_log_index_and_term(&self) -> (i64, i64) {
        match self.log.last() {
            Some(entry) => (self.log.len() as i64 - 1, entry.term),
            None => (-1, -1),
        }
    }

    /// Whether a candidate's log is at least as up-to-date as ours:
    /// strictly greater last term, or equal last term and >= last index.
    pub fn is_log_up_to_date(&self, last_log_index: i64, last_log_term: i64) -> bool {
        let (our_index, our_term) = self.last_log_index_and_term();
        last_log_term > our_term || (last_log_term == our_term && last_log_index >= our_index)
    }

    /// Transition to follower in the given term. Field changes only; the
    /// consensus module restarts the election timer and persists.
    pub fn become_follower(&mut self, term: i64) {
        self.role = Role::Follower;
        self.current_term = term;
        self.voted_for = None;
        self.election_reset = Instant::now();
        // A live leader loop observes the dropped sender and exits.
        self.trigger_tx = None;
    }

    /// Transition to candidate for a new term, voting for self.
    pub fn become_candidate(&mut self, my_id: u64) {
        self.role = Role::Candidate;
        self.current_term += 1;
        self.voted_for = Some(my_id);
        self.election_reset = Instant::now();
    }

    /// Transition to leader: every peer is assumed to be fully behind
    /// (`next_index` = end of log) until proven otherwise.
    pub fn become_leader(&mut self, peer_ids: &[u64]) {
        self.role = Role::Leader;
        let next = self.log.len() as i64;
        for &peer_id in peer_ids {
            self.next_index.insert(peer_id, next);
            self.match_index.insert(peer_id, -1);
        }
    }

    /// Reconcile the local log with entries received from a legitimate
    /// leader, starting after `prev_log_index`.
    ///
    /// Walks both sequences while terms agree, then truncates the local log
    /// at the first divergence and appends the remainder. Replaying the
    /// same arguments is a no-op.
    pub fn merge_leader_entries(&mut self, prev_log_index: i64, entries: &[LogEntry<C>]) {
        let mut log_insert = (prev_log_index + 1) as usize;
        let mut new_index = 0;
        while log_insert < self.log.len()
            && new_index < entries.len()
            && self.log[log_insert].term == entries[new_index].term
        {
            log_insert += 1;
            new_index += 1;
        }
        if new_index < entries.len() {
            self.log.truncate(log_insert);
            self.log.extend_from_slice(&entries[new_index..]);
        }
    }

    /// Non-blocking nudge of the commit-delivery task. A full buffer means
    /// a wakeup is already pending; a closed channel means the replica is
    /// stopped. Both are fine to ignore.
    pub fn notify_commit_ready(&self) {
        if let Some(tx) = &self.commit_ready_tx {
            let _ = tx.try_send(());
        }
    }

    /// Non-blocking nudge of the leader's append loop, same semantics.
    pub fn notify_trigger_append(&self) {
        if let Some(tx) = &self.trigger_tx {
            let _ = tx.try_send(());
        }
    }
}

impl<C: Command> Default for RaftState<C> {
    fn default() -> Self {
        Self::new()
    }
}
