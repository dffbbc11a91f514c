//! Broadcast topics keyed by job id.
//!
//! Every publish folds the event into the job record and sends it on the
//! job's topic while holding the topic gate. A subscriber takes the same gate
//! to read the snapshot and attach its receiver, so it sees every event
//! either in the snapshot or live, never both and never neither.

use crate::core::{JobId, JobRecord, JobSnapshot, ProgressEvent, ProgressMessage, TerminalEvent};
use crate::errors::GenflowError;
use crate::scheduler::JobStore;
use dashmap::DashMap;
use futures::stream::{self, Stream};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug)]
struct Topic {
    sender: broadcast::Sender<ProgressMessage>,
    gate: Mutex<()>,
}

/// Publishes job progress and serves subscriptions.
#[derive(Debug)]
pub struct ProgressChannel {
    topics: DashMap<JobId, Arc<Topic>>,
    store: Arc<dyn JobStore>,
    capacity: usize,
}

impl ProgressChannel {
    /// Creates a channel whose topics buffer `capacity` messages.
    #[must_use]
    pub fn new(store: Arc<dyn JobStore>, capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            store,
            capacity: capacity.max(1),
        }
    }

    fn topic(&self, job_id: JobId) -> Arc<Topic> {
        self.topics
            .entry(job_id)
            .or_insert_with(|| {
                let (sender, _) = broadcast::channel(self.capacity);
                Arc::new(Topic {
                    sender,
                    gate: Mutex::new(()),
                })
            })
            .value()
            .clone()
    }

    /// Opens the topic of a job before its run starts.
    pub fn open(&self, job_id: JobId) {
        self.topic(job_id);
    }

    /// Number of jobs with an open topic.
    #[must_use]
    pub fn open_topics(&self) -> usize {
        self.topics.len()
    }

    /// Folds a stage event into the job record and sends it to subscribers.
    ///
    /// # Errors
    ///
    /// Returns `GenflowError::Store` if the record cannot be updated.
    pub async fn publish(&self, job_id: JobId, event: ProgressEvent) -> Result<(), GenflowError> {
        let topic = self.topic(job_id);
        let _gate = topic.gate.lock().await;
        self.store.record_stage_event(job_id, &event).await?;
        debug!(
            job_id = %job_id,
            stage = %event.stage_name,
            status = %event.status,
            "Progress event"
        );
        // No receivers is fine; the record already holds the state.
        let _ = topic.sender.send(ProgressMessage::Stage(event));
        Ok(())
    }

    /// Applies the terminal transition, notifies subscribers and closes the
    /// topic. Returns the final record.
    ///
    /// # Errors
    ///
    /// Returns `GenflowError::Store` if the record cannot be finalized.
    pub async fn publish_terminal(&self, terminal: TerminalEvent) -> Result<JobRecord, GenflowError> {
        let job_id = terminal.job_id;
        let topic = self.topic(job_id);
        let record = {
            let _gate = topic.gate.lock().await;
            let record = self.store.finalize(job_id, &terminal).await;
            let _ = topic.sender.send(ProgressMessage::Terminal(terminal));
            record
        };
        self.topics.remove_if(&job_id, |_, current| Arc::ptr_eq(current, &topic));
        Ok(record?)
    }

    /// Subscribes to a job: the current snapshot first, then live messages
    /// until the terminal one.
    ///
    /// # Errors
    ///
    /// Returns `GenflowError::JobNotFound` if the job has no record.
    pub async fn subscribe(&self, job_id: JobId) -> Result<ProgressSubscription, GenflowError> {
        if self.store.get(job_id).await.is_none() {
            return Err(GenflowError::JobNotFound(job_id));
        }
        let topic = self.topic(job_id);
        let _gate = topic.gate.lock().await;
        let record = self
            .store
            .get(job_id)
            .await
            .ok_or(GenflowError::JobNotFound(job_id))?;

        let receiver = if record.is_terminal() {
            // A finished job has nothing live left to send.
            self.topics.remove_if(&job_id, |_, current| Arc::ptr_eq(current, &topic));
            None
        } else {
            Some(topic.sender.subscribe())
        };

        Ok(ProgressSubscription {
            job_id,
            snapshot: Some(record.snapshot()),
            receiver,
        })
    }
}

/// One subscriber's view of a job.
#[derive(Debug)]
pub struct ProgressSubscription {
    job_id: JobId,
    snapshot: Option<JobSnapshot>,
    receiver: Option<broadcast::Receiver<ProgressMessage>>,
}

impl ProgressSubscription {
    /// The job this subscription follows.
    #[must_use]
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Next message, or `None` once the job finished.
    pub async fn next(&mut self) -> Option<ProgressMessage> {
        if let Some(snapshot) = self.snapshot.take() {
            return Some(ProgressMessage::Snapshot(snapshot));
        }
        let receiver = self.receiver.as_mut()?;
        loop {
            match receiver.recv().await {
                Ok(message) => {
                    if message.is_terminal() {
                        self.receiver = None;
                    }
                    return Some(message);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(job_id = %self.job_id, skipped, "Progress subscriber lagged");
                }
                Err(RecvError::Closed) => {
                    self.receiver = None;
                    return None;
                }
            }
        }
    }

    /// Drains every remaining message.
    pub async fn collect(mut self) -> Vec<ProgressMessage> {
        let mut messages = Vec::new();
        while let Some(message) = self.next().await {
            messages.push(message);
        }
        messages
    }

    /// Converts the subscription into a `Stream`.
    pub fn into_stream(self) -> impl Stream<Item = ProgressMessage> + Send {
        stream::unfold(self, |mut subscription| async move {
            subscription.next().await.map(|message| (message, subscription))
        })
    }
}
