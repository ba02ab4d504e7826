//! Consumers of streamed text.

use async_lock::Mutex;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};

/// Receives generated text as it arrives, e.g. an editor buffer.
///
/// `append` may be called in rapid succession with small fragments.
#[async_trait]
pub trait OutputSink: Send + Sync {
    /// Prepare the surface before the first fragment.
    async fn open(&self) -> anyhow::Result<()>;

    async fn append(&self, text: &str) -> anyhow::Result<()>;
}

/// Collects fragments in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    opened: AtomicBool,
    fragments: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn was_opened(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    pub async fn fragments(&self) -> Vec<String> {
        self.fragments.lock().await.clone()
    }

    pub async fn text(&self) -> String {
        self.fragments.lock().await.concat()
    }
}

#[async_trait]
impl OutputSink for MemorySink {
    async fn open(&self) -> anyhow::Result<()> {
        self.opened.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn append(&self, text: &str) -> anyhow::Result<()> {
        self.fragments.lock().await.push(text.to_string());
        Ok(())
    }
}
