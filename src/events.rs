//! Progress events and the cancellation token threaded through parsers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::{Error, Result};

/// Events published by the core for the UI to consume.
///
/// Producers emit at most one event per chunk boundary; consumers may lag
/// and coalesce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum Event {
    #[serde(rename = "fname-pool-progress")]
    FNamePoolProgress {
        current_chunk: u32,
        total_chunks: u32,
        current_names: u32,
        total_names: u32,
    },
    #[serde(rename = "guobject-array-progress")]
    GuObjectArrayProgress {
        current_chunk: u32,
        total_chunks: u32,
        current_objects: u32,
        total_objects: u32,
    },
    /// Informational broadcast from the UI when the user picks a target.
    #[serde(rename = "process-selected")]
    ProcessSelected {
        #[serde(rename = "processName")]
        process_name: String,
        pid: u32,
    },
}

/// The single-producer multi-consumer progress channel.
pub struct EventChannel {
    sender: broadcast::Sender<Event>,
}

impl EventChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Publishes an event. Dropped silently when nobody listens.
    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }
}

/// Cooperative cancellation checked between remote reads.
///
/// A cancelled parser abandons its in-flight chunk and never installs its
/// latch; the reads themselves are short and run to completion.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Errors with [`Error::Cancelled`] once the token fires.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}
