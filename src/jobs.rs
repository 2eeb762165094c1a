//! Background generation queue.
//!
//! Callers enqueue a deck and get a [`JobId`] back immediately; a single
//! worker task drains the queue and runs [`DeckGenerator::generate_deck`]
//! for one deck at a time. Job state lives in a shared map the caller can
//! poll, alongside [`DeckGenerator::generation_progress`] for chunk-level
//! detail. Credentials travel with each job, never through globals.
//!
//! Finished jobs stay in the map until the caller drops them with
//! [`GenerationQueue::forget`] or [`GenerationQueue::prune_finished`].

use crate::config::Credentials;
use crate::error::DeckGenError;
use crate::generate::{DeckGenerator, GenerationReport};
use crate::model::DeckId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

pub type JobId = Uuid;

/// How often [`GenerationQueue::wait`] re-reads a job's state.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Done,
    Failed,
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatus {
    pub id: JobId,
    pub deck_id: DeckId,
    pub state: JobState,
    pub report: Option<GenerationReport>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

type JobMap = Arc<RwLock<HashMap<JobId, JobStatus>>>;

struct JobMessage {
    job_id: JobId,
    deck_id: DeckId,
    credentials: Credentials,
}

/// Queue of deck generations served by one worker task.
pub struct GenerationQueue {
    sender: mpsc::Sender<JobMessage>,
    jobs: JobMap,
    generator: Arc<DeckGenerator>,
    worker: JoinHandle<()>,
}

impl GenerationQueue {
    /// Spawn the worker on the current Tokio runtime.
    ///
    /// `capacity` bounds how many jobs may wait; [`Self::start_generation`]
    /// waits for room when the queue is full.
    pub fn start(generator: Arc<DeckGenerator>, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let jobs: JobMap = Arc::default();
        let worker = GenerationWorker {
            receiver,
            generator: Arc::clone(&generator),
            jobs: Arc::clone(&jobs),
        };
        let worker = tokio::spawn(worker.run());
        Self {
            sender,
            jobs,
            generator,
            worker,
        }
    }

    /// Enqueue a full generation of `deck_id`.
    pub async fn start_generation(
        &self,
        deck_id: DeckId,
        credentials: Credentials,
    ) -> Result<JobId, DeckGenError> {
        self.generator.store().get_deck(deck_id).await?;

        let job_id = Uuid::new_v4();
        let now = Utc::now();
        self.jobs.write().await.insert(
            job_id,
            JobStatus {
                id: job_id,
                deck_id,
                state: JobState::Pending,
                report: None,
                error: None,
                created_at: now,
                updated_at: now,
            },
        );

        let message = JobMessage {
            job_id,
            deck_id,
            credentials,
        };
        if self.sender.send(message).await.is_err() {
            self.jobs.write().await.remove(&job_id);
            return Err(DeckGenError::Internal("Generation worker has stopped".into()));
        }
        tracing::info!(job_id = %job_id, deck_id, "Generation job queued");
        Ok(job_id)
    }

    pub async fn job_state(&self, job_id: JobId) -> Option<JobStatus> {
        self.jobs.read().await.get(&job_id).cloned()
    }

    /// Poll until the job is done or failed. `None` for an unknown id.
    pub async fn wait(&self, job_id: JobId) -> Option<JobStatus> {
        loop {
            let status = self.job_state(job_id).await?;
            if status.state.is_finished() {
                return Some(status);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Drop a finished job and return its final status.
    ///
    /// Pending and running jobs are left in place and `None` is returned.
    pub async fn forget(&self, job_id: JobId) -> Option<JobStatus> {
        let mut jobs = self.jobs.write().await;
        if !jobs.get(&job_id)?.state.is_finished() {
            return None;
        }
        jobs.remove(&job_id)
    }

    /// Drop every finished job. Returns how many were removed.
    pub async fn prune_finished(&self) -> usize {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, job| !job.state.is_finished());
        before - jobs.len()
    }

    /// Stop accepting jobs and wait for queued ones to finish.
    pub async fn shutdown(self) {
        drop(self.sender);
        if let Err(e) = self.worker.await {
            tracing::error!(error = %e, "Generation worker panicked");
        }
    }
}

struct GenerationWorker {
    receiver: mpsc::Receiver<JobMessage>,
    generator: Arc<DeckGenerator>,
    jobs: JobMap,
}

impl GenerationWorker {
    async fn run(mut self) {
        tracing::info!("Generation worker started");
        while let Some(msg) = self.receiver.recv().await {
            let span =
                tracing::info_span!("generation_job", job_id = %msg.job_id, deck_id = msg.deck_id);
            self.handle(msg).instrument(span).await;
        }
        tracing::info!("Generation worker stopped: channel closed");
    }

    async fn handle(&self, msg: JobMessage) {
        self.update(msg.job_id, JobState::Running, None, None).await;
        match self.generator.generate_deck(msg.deck_id, &msg.credentials).await {
            Ok(report) => {
                tracing::info!(ok_cards = report.ok_cards, "Generation job done");
                self.update(msg.job_id, JobState::Done, Some(report), None).await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Generation job failed");
                self.update(msg.job_id, JobState::Failed, None, Some(e.to_string()))
                    .await;
            }
        }
    }

    async fn update(
        &self,
        job_id: JobId,
        state: JobState,
        report: Option<GenerationReport>,
        error: Option<String>,
    ) {
        if let Some(job) = self.jobs.write().await.get_mut(&job_id) {
            job.state = state;
            job.report = report;
            job.error = error;
            job.updated_at = Utc::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finished_states() {
        assert!(!JobState::Pending.is_finished());
        assert!(!JobState::Running.is_finished());
        assert!(JobState::Done.is_finished());
        assert!(JobState::Failed.is_finished());
    }

    #[test]
    fn state_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&JobState::Running).unwrap(), "\"running\"");
    }
}
