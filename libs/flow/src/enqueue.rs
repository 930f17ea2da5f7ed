//! Outbound enqueue seam between the flow engine and the queue.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;
use wg_core::types::OutboundJob;

#[async_trait]
pub trait OutboundEnqueuer: Send + Sync {
    async fn enqueue(&self, job: OutboundJob) -> Result<()>;
}

pub type SharedEnqueuer = Arc<dyn OutboundEnqueuer>;

/// Captures enqueued jobs for engine tests.
#[derive(Clone, Default)]
pub struct RecordingEnqueuer {
    jobs: Arc<Mutex<Vec<OutboundJob>>>,
}

impl RecordingEnqueuer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn jobs(&self) -> Vec<OutboundJob> {
        self.jobs.lock().await.clone()
    }

    pub async fn take(&self) -> Vec<OutboundJob> {
        let mut guard = self.jobs.lock().await;
        std::mem::take(&mut *guard)
    }
}

#[async_trait]
impl OutboundEnqueuer for RecordingEnqueuer {
    async fn enqueue(&self, job: OutboundJob) -> Result<()> {
        self.jobs.lock().await.push(job);
        Ok(())
    }
}
