//! Persistence tests: crash/restart recovery through the storage
//! collaborator and the all-or-nothing restore contract.


use std::sync::Arc;
use std::time::Duration;

use raft_lite::storage::keys;
use raft_lite::{MemStorage, RaftError, Storage};
use test_harness::{idle_replica, idle_replica_on, TestCluster};

/// A crashed follower restarts from storage and re-delivers the full
/// committed prefix in order, then catches up on what it missed.
#[tokio::test]
async fn test_follower_crash_and_restart() {
    let mut cluster = TestCluster::new(3).await;

    let (leader_id, _) = cluster
        .wait_for_stable_leader()
        .await
        .expect("a leader should be elected");
    let follower = cluster
        .live_ids()
        .into_iter()
        .find(|&id| id != leader_id)
        .unwrap();

    assert!(cluster.submit(leader_id, "x").await);
    assert!(cluster.submit(leader_id, "y").await);
    assert!(
        cluster
            .wait_for_commits_on_all(2, Duration::from_secs(3))
            .await
    );

    cluster.crash(follower).await;
    assert!(cluster.submit(leader_id, "z").await);
    assert!(
        cluster
            .wait_for_commits_on_all(3, Duration::from_secs(3))
            .await,
        "the remaining majority should keep committing"
    );

    cluster.restart(follower).await;
    assert!(
        cluster
            .wait_for_commits(follower, 3, Duration::from_secs(5))
            .await,
        "the restarted follower should re-deliver and catch up"
    );

    let commits = cluster.committed(follower);
    let commands: Vec<&str> = commits.iter().map(|c| c.command.as_str()).collect();
    assert_eq!(commands, ["x", "y", "z"]);
    for (i, commit) in commits.iter().enumerate() {
        assert_eq!(commit.index, i as i64);
    }

    cluster.shutdown().await;
}

/// Leader crash and recovery: the survivors elect a new leader and keep
/// committing; the restarted old leader converges onto their log.
#[tokio::test]
async fn test_leader_crash_recovery() {
    let mut cluster = TestCluster::new(3).await;

    let (old_leader, old_term) = cluster
        .wait_for_stable_leader()
        .await
        .expect("a leader should be elected");

    assert!(cluster.submit(old_leader, "x").await);
    assert!(
        cluster
            .wait_for_commits_on_all(1, Duration::from_secs(3))
            .await
    );

    cluster.crash(old_leader).await;

    let (new_leader, new_term) = cluster
        .check_new_leader(old_leader)
        .await
        .expect("survivors should elect a new leader");
    assert!(new_term > old_term);

    assert!(cluster.submit(new_leader, "z").await);
    assert!(
        cluster
            .wait_for_commits_on_all(2, Duration::from_secs(3))
            .await
    );
    for id in cluster.live_ids() {
        let commits = cluster.committed(id);
        assert_eq!(commits[1].command, "z");
        assert_eq!(commits[1].index, 1);
    }

    cluster.restart(old_leader).await;
    assert!(
        cluster
            .wait_for_commits(old_leader, 2, Duration::from_secs(5))
            .await,
        "the restarted replica should be brought up to date"
    );

    let commits = cluster.committed(old_leader);
    let commands: Vec<&str> = commits.iter().map(|c| c.command.as_str()).collect();
    assert_eq!(commands, ["x", "z"]);
    assert_eq!(commits[0].index, 0);
    assert_eq!(commits[1].index, 1);
    assert!(commits[1].term >= new_term);

    cluster.shutdown().await;
}

/// Durable state round-trips through storage: a replica built on the same
/// storage sees the exact term, vote, and log it left behind.
#[tokio::test]
async fn test_persistence_round_trip() {
    use raft_lite::{AppendEntriesArgs, LogEntry, RequestVoteArgs};

    let replica = idle_replica(1, vec![2, 3]);

    // Populate durable state through the RPC handlers.
    let vote = replica
        .module
        .request_vote(RequestVoteArgs {
            term: 1,
            candidate_id: 2,
            last_log_index: -1,
            last_log_term: -1,
        })
        .await
        .unwrap();
    assert!(vote.vote_granted);

    let append = replica
        .module
        .append_entries(AppendEntriesArgs {
            term: 1,
            leader_id: 2,
            prev_log_index: -1,
            prev_log_term: -1,
            entries: vec![
                LogEntry {
                    command: "x".to_string(),
                    term: 1,
                },
                LogEntry {
                    command: "y".to_string(),
                    term: 1,
                },
            ],
            leader_commit: -1,
        })
        .await
        .unwrap();
    assert!(append.success);

    replica.module.stop().await;

    let restored = idle_replica_on(1, vec![2, 3], replica.storage.clone())
        .expect("restore should succeed with all keys present");
    let state = restored.module.state.lock().await;
    assert_eq!(state.current_term, 1);
    assert_eq!(state.voted_for, Some(2));
    assert_eq!(state.log.len(), 2);
    assert_eq!(state.log[0].command, "x");
    assert_eq!(state.log[1].command, "y");
    assert_eq!(state.log[1].term, 1);
}

/// Restore is all-or-nothing: a storage with any of the three keys
/// missing refuses to start.
#[tokio::test]
async fn test_restore_requires_all_keys() {
    let storage = Arc::new(MemStorage::new());
    storage.set(keys::CURRENT_TERM, bincode::serialize(&3i64).unwrap());
    storage.set(
        keys::VOTED_FOR,
        bincode::serialize(&Option::<u64>::None).unwrap(),
    );
    // No log key.

    let err = idle_replica_on(1, vec![2, 3], storage).err().expect("construction must fail");
    assert!(matches!(err, RaftError::MissingKey(key) if key == keys::LOG));
}
