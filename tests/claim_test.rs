//! Claim state machine against the in-memory store: batch claims,
//! concurrent claimers, attempt accounting.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use harvest_rs::claim::{ClaimPolicy, FailOutcome, InMemoryTaskStore, TaskClaimStore, TaskStore};
use harvest_rs::model::{NewTask, TaskState};
use serde_json::json;

fn claims(max_attempts: u32) -> TaskClaimStore<InMemoryTaskStore> {
    TaskClaimStore::new(
        InMemoryTaskStore::new(),
        ClaimPolicy {
            max_attempts,
            stale_after: Duration::from_secs(900),
        },
    )
}

async fn seed(claims: &TaskClaimStore<InMemoryTaskStore>, n: usize) {
    for i in 0..n {
        claims
            .store()
            .insert(NewTask::new("banner").payload(json!({ "n": i })))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn two_batches_split_the_backlog() {
    let claims = claims(3);
    seed(&claims, 10).await;

    let first = claims.claim(5, 3).await.unwrap();
    assert_eq!(first.len(), 5);
    assert!(
        first
            .iter()
            .all(|t| t.state == TaskState::Claimed && t.attempts == 1)
    );

    let second = claims.claim(5, 3).await.unwrap();
    assert_eq!(second.len(), 5);

    let first_ids: HashSet<_> = first.iter().map(|t| t.id).collect();
    assert!(second.iter().all(|t| !first_ids.contains(&t.id)));

    assert!(claims.claim(5, 3).await.unwrap().is_empty());
    let counts = claims.store().counts_by_state().await.unwrap();
    assert_eq!((counts.pending, counts.claimed), (0, 10));
}

#[tokio::test]
async fn third_failure_is_terminal() {
    let claims = claims(3);
    seed(&claims, 1).await;

    let mut outcomes = Vec::new();
    for _ in 0..3 {
        let task = claims.claim(1, 3).await.unwrap().remove(0);
        outcomes.push(claims.fail(&task.id, "render timeout", task.attempts).await.unwrap());
    }
    assert_eq!(
        outcomes,
        vec![FailOutcome::Requeued, FailOutcome::Requeued, FailOutcome::Failed]
    );

    assert!(claims.claim(1, 3).await.unwrap().is_empty());
    let task = claims.store().list(None, 1).await.unwrap().remove(0);
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.attempts, 3);
}

#[tokio::test]
async fn attempts_count_successful_claims() {
    let claims = claims(5);
    seed(&claims, 1).await;

    let mut seen = Vec::new();
    for _ in 0..4 {
        let task = claims.claim_batch(1).await.unwrap().remove(0);
        seen.push(task.attempts);
        claims.fail(&task.id, "retry me", task.attempts).await.unwrap();
    }
    assert_eq!(seen, vec![1, 2, 3, 4]);

    let task = claims.store().list(None, 1).await.unwrap().remove(0);
    assert_eq!(task.attempts, 4);
    assert_eq!(task.state, TaskState::Pending);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claimers_never_share_a_task() {
    let claims = Arc::new(claims(3));
    seed(&claims, 40).await;

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let claims = Arc::clone(&claims);
            tokio::spawn(async move { claims.claim(10, 3).await.unwrap() })
        })
        .collect();

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap().into_iter().map(|t| t.id));
    }

    let unique: HashSet<_> = all.iter().collect();
    assert_eq!(unique.len(), all.len(), "a task was handed to two claimers");
    assert!(all.len() <= 40);

    let counts = claims.store().counts_by_state().await.unwrap();
    assert_eq!(counts.claimed as usize, all.len());
}

#[tokio::test]
async fn late_report_from_superseded_claim_is_ignored() {
    let claims = TaskClaimStore::new(
        InMemoryTaskStore::new(),
        ClaimPolicy {
            max_attempts: 3,
            stale_after: Duration::ZERO,
        },
    );
    seed(&claims, 1).await;

    let slow = claims.claim_batch(1).await.unwrap().remove(0);
    let fast = claims.claim_batch(1).await.unwrap().remove(0);
    assert_eq!(slow.id, fast.id);

    assert!(claims.complete(&fast.id, json!("fresh"), fast.attempts).await.unwrap());
    assert_eq!(
        claims.fail(&slow.id, "slow worker gave up", slow.attempts).await.unwrap(),
        FailOutcome::Stale
    );

    let task = claims.store().get(&fast.id).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Done);
    assert_eq!(task.result, Some(json!("fresh")));
    assert_eq!(task.last_error, None);
}
