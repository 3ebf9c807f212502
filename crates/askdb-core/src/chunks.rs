use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use askdb_wire::Chunk;

/// Ordered sink for one request's chunks.
///
/// Nothing is enqueued once the request is cancelled, and at most one
/// terminal chunk is ever sent.
#[derive(Clone)]
pub struct ChunkEmitter {
    tx: mpsc::Sender<Chunk>,
    cancel: CancellationToken,
    terminal_sent: Arc<AtomicBool>,
}

impl ChunkEmitter {
    pub fn new(tx: mpsc::Sender<Chunk>, cancel: CancellationToken) -> Self {
        Self {
            tx,
            cancel,
            terminal_sent: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn channel(capacity: usize, cancel: CancellationToken) -> (Self, mpsc::Receiver<Chunk>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx, cancel), rx)
    }

    /// Intermediate content. Returns whether the chunk was enqueued.
    pub async fn content(&self, text: &str) -> bool {
        if self.terminal_sent.load(Ordering::SeqCst) {
            return false;
        }
        self.send(Chunk::content(text)).await
    }

    /// Terminal chunk. Only the first call sends anything.
    pub async fn finish(&self, chunk: Chunk) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        if self.terminal_sent.swap(true, Ordering::SeqCst) {
            tracing::debug!("second terminal chunk dropped");
            return false;
        }
        self.send(chunk).await
    }

    pub fn terminal_sent(&self) -> bool {
        self.terminal_sent.load(Ordering::SeqCst)
    }

    async fn send(&self, chunk: Chunk) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(chunk) => match sent {
                Ok(()) => true,
                Err(_) => {
                    // Receiver is gone: the client stopped listening.
                    self.cancel.cancel();
                    false
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn only_one_terminal_chunk_is_sent() {
        let (emitter, mut rx) = ChunkEmitter::channel(8, CancellationToken::new());
        assert!(emitter.content("Hel").await);
        assert!(emitter.finish(Chunk::content("Hello")).await);
        assert!(!emitter.finish(Chunk::error("late failure")).await);
        assert!(!emitter.content("more").await);
        drop(emitter);

        let mut received = Vec::new();
        while let Some(chunk) = rx.recv().await {
            received.push(chunk);
        }
        assert_eq!(received, vec![Chunk::content("Hel"), Chunk::content("Hello")]);
    }

    #[tokio::test]
    async fn nothing_is_enqueued_after_cancel() {
        let cancel = CancellationToken::new();
        let (emitter, mut rx) = ChunkEmitter::channel(8, cancel.clone());
        cancel.cancel();
        assert!(!emitter.content("partial").await);
        assert!(!emitter.finish(Chunk::content("done")).await);
        assert!(!emitter.terminal_sent());
        drop(emitter);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropped_receiver_cancels_the_request() {
        let cancel = CancellationToken::new();
        let (emitter, rx) = ChunkEmitter::channel(1, cancel.clone());
        drop(rx);
        assert!(!emitter.content("x").await);
        assert!(cancel.is_cancelled());
    }
}
