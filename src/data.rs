//! Persistence boundary for completed traces.
//!
//! CSV layout, directory structure, and upload all live outside this crate;
//! the engine only knows the [`DataSink`] trait. On success a sink drains
//! the vector it is handed, so records are persisted exactly once.

use crate::error::AppResult;
use crate::trace::TraceRecord;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

/// Receives ownership of accumulated trace records on `SaveData`.
#[async_trait]
pub trait DataSink: Send {
    /// Persist and drain `records`. Leaving records in the vector (on
    /// error) keeps them queued for the next `SaveData`.
    async fn persist(&mut self, records: &mut Vec<TraceRecord>) -> AppResult<()>;
}

/// In-memory sink for tests and dry runs.
#[derive(Default, Clone)]
pub struct MemorySink {
    saved: Arc<Mutex<Vec<TraceRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything persisted so far.
    pub fn saved(&self) -> Vec<TraceRecord> {
        #[allow(clippy::unwrap_used)]
        self.saved.lock().unwrap().clone()
    }
}

#[async_trait]
impl DataSink for MemorySink {
    async fn persist(&mut self, records: &mut Vec<TraceRecord>) -> AppResult<()> {
        #[allow(clippy::unwrap_used)]
        self.saved.lock().unwrap().extend(records.drain(..));
        Ok(())
    }
}
