//! Job record storage.

use crate::core::{JobId, JobRecord, JobStatus, Mode, ProgressEvent, TerminalEvent};
use crate::errors::StoreError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::PathBuf;

/// Filter for [`JobStore::list`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    /// Only jobs of this mode.
    pub mode: Option<Mode>,
    /// Only jobs in this status.
    pub status: Option<JobStatus>,
    /// At most this many records.
    pub limit: Option<usize>,
}

impl JobFilter {
    /// Matches every job.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts to a mode.
    #[must_use]
    pub fn with_mode(mut self, mode: impl Into<Mode>) -> Self {
        self.mode = Some(mode.into());
        self
    }

    /// Restricts to a status.
    #[must_use]
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Caps the number of results.
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, record: &JobRecord) -> bool {
        self.mode.as_ref().map_or(true, |m| *m == record.mode)
            && self.status.map_or(true, |s| s == record.status)
    }
}

/// Persistence for job records.
///
/// Every mutation is applied to a single record atomically. Implementations
/// must keep terminal records unchanged by later stage events.
#[async_trait]
pub trait JobStore: Send + Sync + std::fmt::Debug {
    /// Stores a new record.
    async fn insert(&self, record: JobRecord) -> Result<(), StoreError>;

    /// Returns a copy of a record.
    async fn get(&self, id: JobId) -> Option<JobRecord>;

    /// Moves a pending record to running.
    async fn mark_running(&self, id: JobId) -> Result<(), StoreError>;

    /// Folds a stage event into the record and returns the updated copy.
    async fn record_stage_event(&self, id: JobId, event: &ProgressEvent) -> Result<JobRecord, StoreError>;

    /// Appends artifacts to the record.
    async fn record_artifacts(&self, id: JobId, artifacts: &[PathBuf]) -> Result<(), StoreError>;

    /// Applies the terminal transition and returns the final record.
    async fn finalize(&self, id: JobId, terminal: &TerminalEvent) -> Result<JobRecord, StoreError>;

    /// Lists records, newest first.
    async fn list(&self, filter: &JobFilter) -> Vec<JobRecord>;
}

/// A [`JobStore`] kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    records: DashMap<JobId, JobRecord>,
}

impl InMemoryJobStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn update<T>(&self, id: JobId, f: impl FnOnce(&mut JobRecord) -> T) -> Result<T, StoreError> {
        let mut entry = self.records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        Ok(f(entry.value_mut()))
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, record: JobRecord) -> Result<(), StoreError> {
        match self.records.entry(record.id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(StoreError::Duplicate(record.id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            }
        }
    }

    async fn get(&self, id: JobId) -> Option<JobRecord> {
        self.records.get(&id).map(|r| r.value().clone())
    }

    async fn mark_running(&self, id: JobId) -> Result<(), StoreError> {
        self.update(id, JobRecord::mark_running)
    }

    async fn record_stage_event(&self, id: JobId, event: &ProgressEvent) -> Result<JobRecord, StoreError> {
        self.update(id, |record| {
            if !record.is_terminal() {
                record.apply_stage_event(event);
            }
            record.clone()
        })
    }

    async fn record_artifacts(&self, id: JobId, artifacts: &[PathBuf]) -> Result<(), StoreError> {
        self.update(id, |record| record.add_artifacts(artifacts))
    }

    async fn finalize(&self, id: JobId, terminal: &TerminalEvent) -> Result<JobRecord, StoreError> {
        self.update(id, |record| {
            record.finalize(terminal);
            record.clone()
        })
    }

    async fn list(&self, filter: &JobFilter) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> = self
            .records
            .iter()
            .filter(|r| filter.matches(r.value()))
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        if let Some(limit) = filter.limit {
            records.truncate(limit);
        }
        records
    }
}
