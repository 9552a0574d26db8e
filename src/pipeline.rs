//! Background processing plumbing.
//!
//! The webhook acknowledges the gateway in well under a second; everything
//! slow (state inference, AI runs, outbound sends) happens here. Jobs go
//! through a bounded queue with a fixed worker pool, and a per-participant
//! lock keeps two concurrently-arriving events for the same person from
//! racing on funnel state. Failures surface in the log as dead-letter
//! entries instead of vanishing inside a detached task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error};

use crate::funnel::Funnel;
use crate::normalize::InboundMessage;
use crate::store::Store;
use crate::types::{parse_iso, Direction, Kind, Participant};

/// One `Semaphore(1)` per participant, lifetime bounded to the process.
#[derive(Default)]
pub struct ParticipantLocks {
    locks: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl ParticipantLocks {
    pub fn new() -> ParticipantLocks {
        ParticipantLocks::default()
    }

    pub async fn acquire(&self, key: &str) -> Result<OwnedSemaphorePermit, String> {
        let semaphore = {
            let mut locks = self.locks.lock().unwrap();
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };
        semaphore
            .acquire_owned()
            .await
            .map_err(|_| "participant lock closed".to_string())
    }

    #[cfg(test)]
    pub fn tracked(&self) -> usize {
        self.locks.lock().unwrap().len()
    }
}

/// At-least-once redelivery defence: identical `(text, kind)` to the
/// immediately preceding inbound event, inside a short window, is a replay.
pub async fn is_duplicate_inbound(
    store: &dyn Store,
    participant_id: &str,
    message: &InboundMessage,
    window: Duration,
) -> bool {
    let Ok(events) = store
        .recent_events(participant_id, Some(Direction::Inbound), None, 1)
        .await
    else {
        return false;
    };
    let Some(previous) = events.first() else {
        return false;
    };
    if previous.kind != message.kind || previous.body.as_deref() != message.text.as_deref() {
        return false;
    }
    match parse_iso(&previous.created_at) {
        Some(ts) => Utc::now().signed_duration_since(ts) < window,
        None => false,
    }
}

#[derive(Debug)]
pub struct Job {
    pub participant: Participant,
    pub message: InboundMessage,
}

#[derive(Clone)]
pub struct PipelineQueue {
    tx: mpsc::Sender<Job>,
}

impl PipelineQueue {
    /// Spawn the queue dispatcher. `workers` bounds how many jobs run at
    /// once; the per-participant lock below additionally serializes jobs for
    /// the same person.
    pub fn start(
        funnel: Arc<Funnel>,
        locks: Arc<ParticipantLocks>,
        capacity: usize,
        workers: usize,
    ) -> PipelineQueue {
        let (tx, mut rx) = mpsc::channel::<Job>(capacity.max(1));
        tokio::spawn(async move {
            let limiter = Arc::new(Semaphore::new(workers.max(1)));
            while let Some(job) = rx.recv().await {
                let Ok(permit) = limiter.clone().acquire_owned().await else {
                    break;
                };
                let funnel = funnel.clone();
                let locks = locks.clone();
                tokio::spawn(async move {
                    process_job(&funnel, &locks, job).await;
                    drop(permit);
                });
            }
        });
        PipelineQueue { tx }
    }

    /// Non-blocking: the webhook path never waits on the pipeline. A full
    /// queue drops the job with a dead-letter log entry.
    pub fn enqueue(&self, job: Job) {
        match self.tx.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) => {
                error!(
                    phone = %job.participant.phone,
                    "pipeline queue full, inbound dropped (dead-letter)"
                );
            }
            Err(TrySendError::Closed(job)) => {
                error!(
                    phone = %job.participant.phone,
                    "pipeline queue closed, inbound dropped (dead-letter)"
                );
            }
        }
    }
}

async fn process_job(funnel: &Funnel, locks: &ParticipantLocks, job: Job) {
    let _permit = match locks.acquire(&job.participant.id).await {
        Ok(permit) => permit,
        Err(err) => {
            error!(phone = %job.participant.phone, "lock acquire failed (dead-letter): {err}");
            return;
        }
    };

    let result = match (job.message.kind, job.message.text.as_deref()) {
        (Kind::Text, Some(text)) => funnel.handle_text(&job.participant, text).await,
        (kind, _) if kind.is_media() => funnel.handle_media(&job.participant, kind).await,
        (kind, _) => {
            debug!(
                phone = %job.participant.phone,
                kind = kind.as_str(),
                "unclassifiable inbound, nothing to do"
            );
            Ok(())
        }
    };
    if let Err(err) = result {
        error!(phone = %job.participant.phone, "pipeline failed (dead-letter): {err}");
    }
}
