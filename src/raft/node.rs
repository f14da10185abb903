use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::Instant;

use crate::config::RaftConfig;
use crate::error::{RaftError, Result};
use crate::raft::rpc::{AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply};
use crate::raft::state::{Command, CommitEntry, LogEntry, RaftState, Role};
use crate::raft::timer;
use crate::storage::{keys, Storage};
use crate::transport::Transport;

/// Buffer of the internal commit-ready channel; sends are non-blocking and
/// a full buffer already carries the wakeup.
const COMMIT_READY_BUFFER: usize = 16;

/// A single Raft replica: elects leaders, replicates a log across the peer
/// set, and delivers committed entries on the commit channel in index
/// order. The peer set is fixed at construction.
///
/// All state lives in one mutex-guarded [`RaftState`] record. Background
/// work runs on spawned tokio tasks: one election timer per
/// follower/candidate epoch, one heartbeat/append loop per leader epoch,
/// one commit-delivery loop for the replica's lifetime, and short-lived
/// per-peer tasks for outgoing RPCs. The mutex is never held across an RPC
/// send or a blocking channel send.
pub struct ConsensusModule<C: Command> {
    pub id: u64,
    pub peer_ids: Vec<u64>,
    /// Exposed for inspection by embedders and integration tests; normal
    /// interaction goes through `submit`/`report` and the RPC handlers.
    pub state: Mutex<RaftState<C>>,
    transport: Arc<dyn Transport<C>>,
    storage: Arc<dyn Storage>,
    config: RaftConfig,
    /// Self-handle for spawning background tasks from `&self` methods.
    weak: Weak<Self>,
}

impl<C: Command> ConsensusModule<C> {
    /// Create a replica and spawn its background tasks. Must be called
    /// within a tokio runtime.
    ///
    /// If the storage already holds data, `current_term`, `voted_for`, and
    /// the log are restored from it; a partially populated storage is a
    /// fatal configuration error. The replica stays idle (no election
    /// timer) until `ready` resolves, so an embedder can construct a whole
    /// cluster before releasing it.
    pub fn new(
        id: u64,
        peer_ids: Vec<u64>,
        transport: Arc<dyn Transport<C>>,
        storage: Arc<dyn Storage>,
        ready: oneshot::Receiver<()>,
        commit_tx: mpsc::Sender<CommitEntry<C>>,
        config: RaftConfig,
    ) -> Result<Arc<Self>> {
        let (commit_ready_tx, commit_ready_rx) = mpsc::channel(COMMIT_READY_BUFFER);
        let mut state = RaftState::new();
        state.commit_ready_tx = Some(commit_ready_tx);

        if storage.has_data() {
            Self::restore_from_storage(storage.as_ref(), &mut state)?;
            tracing::info!(
                id,
                term = state.current_term,
                log_len = state.log.len(),
                "restored durable state"
            );
        }

        let cm = Arc::new_cyclic(|weak| Self {
            id,
            peer_ids,
            state: Mutex::new(state),
            transport,
            storage,
            config,
            weak: weak.clone(),
        });

        tokio::spawn(Arc::clone(&cm).commit_loop(commit_ready_rx, commit_tx));

        let gate = Arc::clone(&cm);
        tokio::spawn(async move {
            // Resolution and drop both release the replica.
            let _ = ready.await;
            {
                let mut state = gate.state.lock().await;
                state.election_reset = Instant::now();
            }
            gate.run_election_timer().await;
        });

        Ok(cm)
    }

    /// Submit a command for replication. Returns `Ok(true)` if this replica
    /// is the leader and accepted the command; commitment is reported later
    /// on the commit channel. Non-leaders return `Ok(false)` and the client
    /// should retry elsewhere.
    pub async fn submit(&self, command: C) -> Result<bool> {
        let mut state = self.state.lock().await;
        tracing::debug!(id = self.id, role = %state.role, "submit received");
        if state.role != Role::Leader {
            return Ok(false);
        }

        let term = state.current_term;
        state.log.push(LogEntry { command, term });
        self.persist_or_halt(&mut state)?;
        tracing::debug!(id = self.id, term, log_len = state.log.len(), "appended command");
        state.notify_trigger_append();
        Ok(true)
    }

    /// Snapshot of (id, current term, is-leader).
    pub async fn report(&self) -> (u64, i64, bool) {
        let state = self.state.lock().await;
        (self.id, state.current_term, state.role == Role::Leader)
    }

    /// Permanently stop the replica. Closes the internal commit-ready
    /// channel so the delivery loop drains outstanding commits and exits;
    /// subsequent RPCs are answered with [`RaftError::Stopped`].
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        state.role = Role::Dead;
        state.commit_ready_tx = None;
        state.trigger_tx = None;
        tracing::info!(id = self.id, "becomes dead");
    }

    /// Inbound RequestVote RPC handler, dispatched by the transport.
    pub async fn request_vote(&self, args: RequestVoteArgs) -> Result<RequestVoteReply> {
        let mut state = self.state.lock().await;
        if state.role == Role::Dead {
            return Err(RaftError::Stopped);
        }
        tracing::debug!(
            id = self.id,
            candidate = args.candidate_id,
            term = args.term,
            current_term = state.current_term,
            "RequestVote received"
        );

        if args.term > state.current_term {
            tracing::debug!(id = self.id, "term out of date in RequestVote");
            self.become_follower(&mut state, args.term);
        }

        let mut vote_granted = false;
        if state.current_term == args.term
            && state.voted_for.map_or(true, |v| v == args.candidate_id)
            && state.is_log_up_to_date(args.last_log_index, args.last_log_term)
        {
            vote_granted = true;
            state.voted_for = Some(args.candidate_id);
            state.election_reset = Instant::now();
        }

        let reply = RequestVoteReply {
            term: state.current_term,
            vote_granted,
        };
        self.persist_or_halt(&mut state)?;
        tracing::debug!(id = self.id, granted = vote_granted, term = reply.term, "RequestVote reply");
        Ok(reply)
    }

    /// Inbound AppendEntries RPC handler, dispatched by the transport.
    /// Handles both heartbeats and log replication; replaying identical
    /// arguments leaves the log unchanged.
    pub async fn append_entries(&self, args: AppendEntriesArgs<C>) -> Result<AppendEntriesReply> {
        let mut state = self.state.lock().await;
        if state.role == Role::Dead {
            return Err(RaftError::Stopped);
        }
        tracing::debug!(
            id = self.id,
            leader = args.leader_id,
            term = args.term,
            prev_log_index = args.prev_log_index,
            entries = args.entries.len(),
            leader_commit = args.leader_commit,
            "AppendEntries received"
        );

        if args.term > state.current_term {
            tracing::debug!(id = self.id, "term out of date in AppendEntries");
            self.become_follower(&mut state, args.term);
        }

        let mut success = false;
        if args.term == state.current_term {
            // A candidate observing a legitimate leader of its own term
            // steps down; only one leader can exist per term.
            if state.role != Role::Follower {
                self.become_follower(&mut state, args.term);
            }
            state.election_reset = Instant::now();

            let prev_ok = args.prev_log_index == -1
                || (args.prev_log_index < state.log.len() as i64
                    && state.log[args.prev_log_index as usize].term == args.prev_log_term);
            if prev_ok {
                success = true;
                state.merge_leader_entries(args.prev_log_index, &args.entries);

                if args.leader_commit > state.commit_index {
                    state.commit_index = args.leader_commit.min(state.log.len() as i64 - 1);
                    tracing::debug!(
                        id = self.id,
                        commit_index = state.commit_index,
                        "follower commit index advanced"
                    );
                    state.notify_commit_ready();
                }
            }
        }

        let reply = AppendEntriesReply {
            term: state.current_term,
            success,
        };
        self.persist_or_halt(&mut state)?;
        tracing::debug!(id = self.id, success, term = reply.term, "AppendEntries reply");
        Ok(reply)
    }

    /// Spawn a fresh election timer task for the current epoch. Skipped if
    /// the module is already being dropped.
    fn spawn_election_timer(&self) {
        if let Some(cm) = self.weak.upgrade() {
            tokio::spawn(cm.run_election_timer());
        }
    }

    /// Election timer task, one per follower/candidate epoch. Polls every
    /// 10 ms and exits as soon as the role or term it was started for is
    /// gone; if the deadline passes first, it starts an election.
    async fn run_election_timer(self: Arc<Self>) {
        let timeout = timer::election_timeout(&self.config);
        let term_started = self.state.lock().await.current_term;
        tracing::debug!(
            id = self.id,
            term = term_started,
            timeout_ms = timeout.as_millis() as u64,
            "election timer started"
        );

        loop {
            tokio::time::sleep(timer::ELECTION_TICK_INTERVAL).await;

            let mut state = self.state.lock().await;
            if state.role != Role::Candidate && state.role != Role::Follower {
                tracing::debug!(id = self.id, role = %state.role, "election timer bailing out");
                return;
            }
            if state.current_term != term_started {
                tracing::debug!(
                    id = self.id,
                    term = state.current_term,
                    "election timer superseded by newer term"
                );
                return;
            }
            if state.election_reset.elapsed() >= timeout {
                self.start_election(&mut state);
                return;
            }
        }
    }

    /// Become candidate and solicit votes from every peer. Called with the
    /// state mutex held; vote replies are processed by per-peer tasks.
    fn start_election(&self, state: &mut RaftState<C>) {
        state.become_candidate(self.id);
        let term = state.current_term;
        tracing::info!(id = self.id, term, log_len = state.log.len(), "becomes candidate");
        if self.persist_or_halt(state).is_err() {
            return;
        }

        let Some(this) = self.weak.upgrade() else {
            return;
        };

        // Self-vote; replies race on this counter rather than the mutex.
        let votes = Arc::new(AtomicU32::new(1));

        for &peer_id in &self.peer_ids {
            let cm = Arc::clone(&this);
            let votes = Arc::clone(&votes);
            tokio::spawn(async move {
                let (last_log_index, last_log_term) = {
                    let state = cm.state.lock().await;
                    state.last_log_index_and_term()
                };
                let args = RequestVoteArgs {
                    term,
                    candidate_id: cm.id,
                    last_log_index,
                    last_log_term,
                };

                tracing::debug!(id = cm.id, peer_id, term, "sending RequestVote");
                let reply = match cm.transport.request_vote(peer_id, args).await {
                    Ok(reply) => reply,
                    Err(err) => {
                        tracing::debug!(id = cm.id, peer_id, error = %err, "RequestVote failed");
                        return;
                    }
                };

                let mut state = cm.state.lock().await;
                if state.role != Role::Candidate {
                    tracing::debug!(id = cm.id, role = %state.role, "stale RequestVote reply");
                    return;
                }
                if reply.term > term {
                    tracing::debug!(id = cm.id, term = reply.term, "term out of date in RequestVote reply");
                    cm.become_follower(&mut state, reply.term);
                    let _ = cm.persist_or_halt(&mut state);
                    return;
                }
                if reply.term == term && reply.vote_granted {
                    let tally = votes.fetch_add(1, Ordering::SeqCst) + 1;
                    if 2 * tally as usize > cm.peer_ids.len() + 1 {
                        tracing::info!(id = cm.id, term, votes = tally, "wins election");
                        cm.start_leader(&mut state);
                    }
                }
            });
        }

        // A fresh timer resolves split votes by timing out into a new term.
        self.spawn_election_timer();
    }

    /// Step down into the given term. Called with the state mutex held;
    /// callers persist afterwards since the term (and vote) changed.
    fn become_follower(&self, state: &mut RaftState<C>, term: i64) {
        tracing::info!(id = self.id, term, "becomes follower");
        state.become_follower(term);
        self.spawn_election_timer();
    }

    /// Become leader for the current term and spawn the heartbeat/append
    /// loop. Called with the state mutex held.
    fn start_leader(&self, state: &mut RaftState<C>) {
        state.become_leader(&self.peer_ids);
        let term = state.current_term;
        tracing::info!(id = self.id, term, log_len = state.log.len(), "becomes leader");

        // Fresh trigger channel for this leader epoch; dropping the sender
        // (step-down or stop) wakes the loop so it exits promptly.
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        state.trigger_tx = Some(trigger_tx);

        if let Some(cm) = self.weak.upgrade() {
            tokio::spawn(cm.leader_loop(term, trigger_rx));
        }
    }

    /// Heartbeat/append loop, one per leader epoch. Sends immediately on
    /// election, then again whenever the heartbeat timer fires or a submit
    /// or commit advance nudges the trigger channel.
    async fn leader_loop(self: Arc<Self>, term: i64, mut trigger_rx: mpsc::Receiver<()>) {
        let heartbeat = Duration::from_millis(self.config.heartbeat_interval_ms);
        self.send_append_entries().await;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(heartbeat) => {}
                wake = trigger_rx.recv() => {
                    if wake.is_none() {
                        return;
                    }
                }
            }

            {
                let state = self.state.lock().await;
                if state.role != Role::Leader || state.current_term != term {
                    tracing::debug!(id = self.id, term, "leader loop exiting");
                    return;
                }
            }
            self.send_append_entries().await;
        }
    }

    /// One round of AppendEntries to every peer. Each peer gets its own
    /// task so a slow or dead peer never delays the others; replies are
    /// processed out of band and out-of-order replies are tolerated.
    async fn send_append_entries(&self) {
        let term = {
            let state = self.state.lock().await;
            if state.role != Role::Leader {
                return;
            }
            state.current_term
        };
        let Some(this) = self.weak.upgrade() else {
            return;
        };

        for &peer_id in &self.peer_ids {
            let cm = Arc::clone(&this);
            tokio::spawn(async move {
                let (ni, sent, args) = {
                    let state = cm.state.lock().await;
                    if state.role != Role::Leader || state.current_term != term {
                        return;
                    }
                    let ni = state.next_index[&peer_id];
                    let prev_log_index = ni - 1;
                    let prev_log_term = if prev_log_index >= 0 {
                        state.log[prev_log_index as usize].term
                    } else {
                        -1
                    };
                    let entries = state.log[ni as usize..].to_vec();
                    let sent = entries.len();
                    let args = AppendEntriesArgs {
                        term,
                        leader_id: cm.id,
                        prev_log_index,
                        prev_log_term,
                        entries,
                        leader_commit: state.commit_index,
                    };
                    (ni, sent, args)
                };

                tracing::debug!(id = cm.id, peer_id, next_index = ni, entries = sent, "sending AppendEntries");
                let reply = match cm.transport.append_entries(peer_id, args).await {
                    Ok(reply) => reply,
                    Err(err) => {
                        tracing::debug!(id = cm.id, peer_id, error = %err, "AppendEntries failed");
                        return;
                    }
                };
                cm.process_append_reply(peer_id, ni, sent, term, reply).await;
            });
        }
    }

    /// Apply one peer's AppendEntries reply: advance or back off that
    /// peer's replication state, then try to advance the commit index over
    /// current-term entries replicated on a majority.
    async fn process_append_reply(
        &self,
        peer_id: u64,
        ni: i64,
        sent: usize,
        term: i64,
        reply: AppendEntriesReply,
    ) {
        let mut state = self.state.lock().await;
        if reply.term > term {
            tracing::debug!(id = self.id, peer_id, term = reply.term, "term out of date in AppendEntries reply");
            self.become_follower(&mut state, reply.term);
            let _ = self.persist_or_halt(&mut state);
            return;
        }
        if state.role != Role::Leader || reply.term != term {
            return;
        }

        if !reply.success {
            // Walk back one entry and let the next cycle retry.
            let backed = (ni - 1).max(0);
            state.next_index.insert(peer_id, backed);
            tracing::debug!(id = self.id, peer_id, next_index = backed, "AppendEntries rejected, backing off");
            return;
        }

        state.next_index.insert(peer_id, ni + sent as i64);
        state.match_index.insert(peer_id, ni + sent as i64 - 1);

        let saved_commit_index = state.commit_index;
        for i in (state.commit_index + 1)..state.log.len() as i64 {
            // Only entries of the current term commit by counting; older
            // entries commit indirectly once a current-term entry above
            // them does (Raft §5.4.2).
            if state.log[i as usize].term != state.current_term {
                continue;
            }
            let mut match_count = 1;
            for p in &self.peer_ids {
                if state.match_index[p] >= i {
                    match_count += 1;
                }
            }
            if 2 * match_count > self.peer_ids.len() + 1 {
                state.commit_index = i;
            }
        }

        if state.commit_index != saved_commit_index {
            tracing::debug!(id = self.id, commit_index = state.commit_index, "leader advances commit index");
            // Wake the delivery loop, and send another round promptly so
            // followers learn the new commit index.
            state.notify_commit_ready();
            state.notify_trigger_append();
        }
    }

    /// Commit-delivery task, one for the replica's lifetime. Each wakeup
    /// drains the newly committed suffix and emits it on the commit
    /// channel in index order; a slow consumer blocks this task only,
    /// never the consensus state machine.
    async fn commit_loop(
        self: Arc<Self>,
        mut commit_ready_rx: mpsc::Receiver<()>,
        commit_tx: mpsc::Sender<CommitEntry<C>>,
    ) {
        while commit_ready_rx.recv().await.is_some() {
            let (term, last_applied, entries) = {
                let mut state = self.state.lock().await;
                let term = state.current_term;
                let last_applied = state.last_applied;
                let entries = if state.commit_index > state.last_applied {
                    let lo = (state.last_applied + 1) as usize;
                    let hi = (state.commit_index + 1) as usize;
                    state.last_applied = state.commit_index;
                    state.log[lo..hi].to_vec()
                } else {
                    Vec::new()
                };
                (term, last_applied, entries)
            };

            for (i, entry) in entries.into_iter().enumerate() {
                let commit = CommitEntry {
                    command: entry.command,
                    index: last_applied + 1 + i as i64,
                    term,
                };
                if commit_tx.send(commit).await.is_err() {
                    tracing::warn!(id = self.id, "commit receiver dropped, stopping delivery");
                    return;
                }
            }
        }
        tracing::debug!(id = self.id, "commit delivery loop done");
    }

    /// Write all three durable keys. Invoked after every change to
    /// `current_term`, `voted_for`, or the log, and always before the
    /// corresponding RPC reply or submit result is released.
    fn persist_to_storage(&self, state: &RaftState<C>) -> Result<()> {
        self.storage
            .set(keys::CURRENT_TERM, bincode::serialize(&state.current_term)?);
        self.storage
            .set(keys::VOTED_FOR, bincode::serialize(&state.voted_for)?);
        self.storage.set(keys::LOG, bincode::serialize(&state.log)?);
        Ok(())
    }

    /// A replica that cannot persist cannot keep its promises; on failure
    /// it is halted in place and the error propagated where possible.
    fn persist_or_halt(&self, state: &mut RaftState<C>) -> Result<()> {
        match self.persist_to_storage(state) {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::error!(id = self.id, error = %err, "cannot persist durable state, halting replica");
                state.role = Role::Dead;
                state.commit_ready_tx = None;
                state.trigger_tx = None;
                Err(err)
            }
        }
    }

    /// All-or-nothing restore of the three durable keys.
    fn restore_from_storage(storage: &dyn Storage, state: &mut RaftState<C>) -> Result<()> {
        let raw = storage
            .get(keys::CURRENT_TERM)
            .ok_or(RaftError::MissingKey(keys::CURRENT_TERM))?;
        state.current_term = bincode::deserialize(&raw)?;

        let raw = storage
            .get(keys::VOTED_FOR)
            .ok_or(RaftError::MissingKey(keys::VOTED_FOR))?;
        state.voted_for = bincode::deserialize(&raw)?;

        let raw = storage
            .get(keys::LOG)
            .ok_or(RaftError::MissingKey(keys::LOG))?;
        state.log = bincode::deserialize(&raw)?;
        Ok(())
    }
}
