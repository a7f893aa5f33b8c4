//! Shared application state for the Axum API server.

use std::sync::Arc;

use herald_engine::receipts::ReceiptRecorder;
use herald_engine::scheduler::BatchScheduler;
use herald_engine::store::JobStore;

use crate::forwarder::ReceiptForwarder;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<BatchScheduler>,
    pub jobs: Arc<dyn JobStore>,
    pub receipts: Arc<ReceiptRecorder>,
    pub forwarder: Option<ReceiptForwarder>,
}

impl AppState {
    pub fn new(
        scheduler: Arc<BatchScheduler>,
        jobs: Arc<dyn JobStore>,
        receipts: Arc<ReceiptRecorder>,
    ) -> Self {
        Self {
            scheduler,
            jobs,
            receipts,
            forwarder: None,
        }
    }

    pub fn with_forwarder(mut self, forwarder: ReceiptForwarder) -> Self {
        self.forwarder = Some(forwarder);
        self
    }
}
