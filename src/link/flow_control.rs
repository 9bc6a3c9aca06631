// Per logical-stream credit window (§4.2): "A single slow consumer must not
// starve others on the same link (per-stream, not per-link, credit)."
// Adapted from the teacher's FlowControlManager, which pools one window
// across all streams on a connection — here each logical stream gets its own
// independent window so draining one never blocks another.

use std::collections::HashMap;
use tokio::sync::{oneshot, Mutex};

use crate::error::{MeshError, Result};

struct StreamWindow {
    available: usize,
    waiters: Vec<(usize, oneshot::Sender<()>)>,
}

impl StreamWindow {
    fn new(initial: usize) -> Self {
        Self { available: initial, waiters: Vec::new() }
    }

    fn try_consume(&mut self, size: usize) -> bool {
        if self.available >= size {
            self.available -= size;
            true
        } else {
            false
        }
    }

    fn credit(&mut self, amount: usize) {
        self.available += amount;
        self.waiters.retain(|(need, _)| *need > self.available);
        let ready: Vec<_> = self
            .waiters
            .iter()
            .enumerate()
            .filter(|(_, (need, _))| *need <= self.available)
            .map(|(i, _)| i)
            .collect();
        for i in ready.into_iter().rev() {
            let (need, tx) = self.waiters.remove(i);
            self.available -= need;
            let _ = tx.send(());
        }
    }
}

/// Tracks one credit window per `logical_stream_id` on a single link.
/// Sending blocks (via `acquire`) when the stream's window is exhausted;
/// receiving (via `credit`, driven by CREDIT frames from the peer) replenishes
/// it.
pub struct LinkFlowControl {
    window_bytes: usize,
    streams: Mutex<HashMap<u64, StreamWindow>>,
}

impl LinkFlowControl {
    pub fn new(window_bytes: usize) -> Self {
        Self { window_bytes, streams: Mutex::new(HashMap::new()) }
    }

    /// Blocks until `size` bytes of send window are available on
    /// `logical_stream_id`, then consumes them.
    pub async fn acquire(&self, logical_stream_id: u64, size: usize) -> Result<()> {
        if size > self.window_bytes {
            return Err(MeshError::InvalidArgument(format!(
                "frame of {size} bytes exceeds the configured credit window of {}",
                self.window_bytes
            )));
        }

        loop {
            let rx = {
                let mut streams = self.streams.lock().await;
                let window = streams
                    .entry(logical_stream_id)
                    .or_insert_with(|| StreamWindow::new(self.window_bytes));

                if window.try_consume(size) {
                    return Ok(());
                }

                let (tx, rx) = oneshot::channel();
                window.waiters.push((size, tx));
                rx
            };

            // Dropped senders mean the stream window was torn down (link closed).
            rx.await.map_err(|_| MeshError::NoRoute("link closed while awaiting credit".into()))?;
        }
    }

    /// Applies a CREDIT frame from the peer, returning send window to a
    /// stream after it consumed data.
    pub async fn credit(&self, logical_stream_id: u64, amount: usize) {
        let mut streams = self.streams.lock().await;
        let window = streams
            .entry(logical_stream_id)
            .or_insert_with(|| StreamWindow::new(self.window_bytes));
        window.credit(amount);
    }

    pub async fn reset_stream(&self, logical_stream_id: u64) {
        self.streams.lock().await.remove(&logical_stream_id);
    }
}
