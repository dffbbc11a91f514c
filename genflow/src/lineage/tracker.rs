//! Lineage records and base artifact resolution.
//!
//! Lineage is a tree: every refinement has exactly one parent, a parent may
//! have any number of children. A parent resolves in one hop to a concrete
//! artifact path because every job, once it saves output, records its own
//! artifacts in its job record.

use crate::core::{JobId, JobRecord};
use crate::errors::{LineageError, ParentNotFoundError};
use crate::scheduler::JobStore;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// What a refinement job refines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParentRef {
    /// One output of an original (non-refinement) job.
    Original {
        /// The original job.
        job_id: JobId,
        /// Index into that job's artifacts.
        output_index: usize,
    },
    /// The output of another refinement job.
    Refinement {
        /// The refinement job.
        job_id: JobId,
    },
}

impl ParentRef {
    /// References output `output_index` of an original job.
    #[must_use]
    pub fn original(job_id: JobId, output_index: usize) -> Self {
        Self::Original { job_id, output_index }
    }

    /// References the output of a refinement job.
    #[must_use]
    pub fn refinement(job_id: JobId) -> Self {
        Self::Refinement { job_id }
    }

    /// The referenced job.
    #[must_use]
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Original { job_id, .. } | Self::Refinement { job_id } => *job_id,
        }
    }
}

impl fmt::Display for ParentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Original { job_id, output_index } => {
                write!(f, "original job {job_id} output {output_index}")
            }
            Self::Refinement { job_id } => write!(f, "refinement job {job_id}"),
        }
    }
}

/// Link from a refinement job to the artifact it refines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineageRecord {
    /// The refinement job.
    pub child: JobId,
    /// What it refines.
    pub parent: ParentRef,
    /// The parent artifact resolved at registration.
    pub base_artifact: PathBuf,
    /// When the link was registered.
    pub registered_at: DateTime<Utc>,
}

/// Registry of lineage records backed by the job store.
#[derive(Debug)]
pub struct LineageTracker {
    store: Arc<dyn JobStore>,
    records: DashMap<JobId, LineageRecord>,
}

impl LineageTracker {
    /// Creates a tracker resolving parents through `store`.
    #[must_use]
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            records: DashMap::new(),
        }
    }

    /// Resolves a parent reference to a concrete artifact path.
    ///
    /// # Errors
    ///
    /// Returns `ParentNotFoundError` if the job does not exist, has the wrong
    /// kind, or has no artifact at the referenced position yet.
    pub async fn resolve_base_artifact(&self, parent: &ParentRef) -> Result<PathBuf, ParentNotFoundError> {
        let record = self
            .store
            .get(parent.job_id())
            .await
            .ok_or_else(|| ParentNotFoundError::new(*parent, "no such job"))?;
        resolve_in_record(parent, &record)
    }

    /// Registers `child` as a refinement of `parent`.
    ///
    /// # Errors
    ///
    /// Returns `LineageError::ParentNotFound` if the parent does not resolve
    /// and `LineageError::AlreadyRegistered` if the child already has a parent.
    pub async fn register(&self, child: JobId, parent: &ParentRef) -> Result<LineageRecord, LineageError> {
        let base_artifact = self.resolve_base_artifact(parent).await?;
        let record = LineageRecord {
            child,
            parent: *parent,
            base_artifact,
            registered_at: Utc::now(),
        };
        match self.records.entry(child) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(LineageError::AlreadyRegistered(child)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(record.clone());
                info!(
                    child = %child,
                    parent = %parent,
                    base_artifact = %record.base_artifact.display(),
                    "Registered refinement lineage"
                );
                Ok(record)
            }
        }
    }

    /// Drops a registration whose job was never created.
    pub(crate) fn forget(&self, child: JobId) {
        if self.records.remove(&child).is_some() {
            debug!(child = %child, "Dropped lineage registration");
        }
    }

    /// The lineage record of a refinement job.
    #[must_use]
    pub fn record(&self, child: JobId) -> Option<LineageRecord> {
        self.records.get(&child).map(|r| r.value().clone())
    }

    /// The parent of a refinement job.
    #[must_use]
    pub fn parent_of(&self, child: JobId) -> Option<ParentRef> {
        self.records.get(&child).map(|r| r.parent)
    }

    /// Jobs registered as direct refinements of `job_id`, oldest first.
    #[must_use]
    pub fn children_of(&self, job_id: JobId) -> Vec<JobId> {
        let mut children: Vec<(DateTime<Utc>, JobId)> = self
            .records
            .iter()
            .filter(|r| r.parent.job_id() == job_id)
            .map(|r| (r.registered_at, r.child))
            .collect();
        children.sort();
        children.into_iter().map(|(_, id)| id).collect()
    }

    /// Parent links from `child` up to the original job, nearest first.
    #[must_use]
    pub fn ancestry(&self, child: JobId) -> Vec<ParentRef> {
        let mut chain = Vec::new();
        let mut seen = HashSet::from([child]);
        let mut current = child;
        while let Some(parent) = self.parent_of(current) {
            chain.push(parent);
            current = parent.job_id();
            if !seen.insert(current) {
                break;
            }
        }
        chain
    }

    /// Number of registered refinements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn resolve_in_record(parent: &ParentRef, record: &JobRecord) -> Result<PathBuf, ParentNotFoundError> {
    match parent {
        ParentRef::Original { output_index, .. } => {
            if record.parent.is_some() {
                return Err(ParentNotFoundError::new(*parent, "job is a refinement, not an original"));
            }
            record.artifacts.get(*output_index).cloned().ok_or_else(|| {
                ParentNotFoundError::new(
                    *parent,
                    format!("job has {} artifact(s), no output {output_index}", record.artifacts.len()),
                )
            })
        }
        ParentRef::Refinement { .. } => {
            if record.parent.is_none() {
                return Err(ParentNotFoundError::new(*parent, "job is not a refinement"));
            }
            record
                .primary_artifact()
                .cloned()
                .ok_or_else(|| ParentNotFoundError::new(*parent, "refinement has no artifact yet"))
        }
    }
}
