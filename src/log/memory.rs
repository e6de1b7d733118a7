//! In-memory observer with a shared handle.

use std::sync::{Arc, Mutex, MutexGuard};

use super::{RunHeader, RunSummary, StepObserver, StepRecord};

#[derive(Debug, Default)]
struct Inner {
    header: Option<RunHeader>,
    records: Vec<StepRecord>,
    summary: Option<RunSummary>,
}

/// Clones share the same storage, so a caller can keep one handle and give
/// another to the runner.
#[derive(Debug, Clone, Default)]
pub struct MemoryLog {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn header(&self) -> Option<RunHeader> {
        self.lock().header.clone()
    }

    pub fn records(&self) -> Vec<StepRecord> {
        self.lock().records.clone()
    }

    pub fn summary(&self) -> Option<RunSummary> {
        self.lock().summary.clone()
    }
}

impl StepObserver for MemoryLog {
    fn on_start(&mut self, header: &RunHeader) -> std::io::Result<()> {
        self.lock().header = Some(header.clone());
        Ok(())
    }

    fn on_step(&mut self, record: &StepRecord) -> std::io::Result<()> {
        self.lock().records.push(record.clone());
        Ok(())
    }

    fn on_finish(&mut self, summary: &RunSummary) -> std::io::Result<()> {
        self.lock().summary = Some(summary.clone());
        Ok(())
    }
}
