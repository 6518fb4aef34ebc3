//! Consumers of finalized chunks.

use crate::pipeline::types::Chunk;
use crossbeam_channel::Sender;
use std::sync::{Arc, Mutex};

/// Pluggable chunk output handler.
/// Pairs with AudioSource for input - this handles enhanced chunk output.
pub trait ChunkSink: Send + 'static {
    /// Handle one chunk. Called in chunk index order.
    fn handle(&mut self, chunk: Chunk) -> crate::error::Result<()>;

    /// Called after the stream's last chunk.
    fn finish(&mut self) {}

    /// Name for logging/debugging.
    fn name(&self) -> &'static str {
        "sink"
    }
}

/// Forwards chunks into a channel. Disconnected receivers are not an error.
pub struct ChannelSink {
    tx: Sender<Chunk>,
}

impl ChannelSink {
    pub fn new(tx: Sender<Chunk>) -> Self {
        Self { tx }
    }
}

impl ChunkSink for ChannelSink {
    fn handle(&mut self, chunk: Chunk) -> crate::error::Result<()> {
        if let Err(e) = self.tx.send(chunk) {
            log::debug!("chunk {} has no receiver", e.0.id);
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "channel"
    }
}

/// Calls a closure for every chunk.
pub struct CallbackSink<F> {
    callback: F,
}

impl<F> CallbackSink<F>
where
    F: FnMut(Chunk) + Send + 'static,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> ChunkSink for CallbackSink<F>
where
    F: FnMut(Chunk) + Send + 'static,
{
    fn handle(&mut self, chunk: Chunk) -> crate::error::Result<()> {
        (self.callback)(chunk);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "callback"
    }
}

/// Keeps every chunk, for tests and batch processing.
#[derive(Clone, Default)]
pub struct CollectorSink {
    chunks: Arc<Mutex<Vec<Chunk>>>,
}

impl CollectorSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the chunks collected so far.
    pub fn chunks(&self) -> Vec<Chunk> {
        match self.chunks.lock() {
            Ok(chunks) => chunks.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn len(&self) -> usize {
        match self.chunks.lock() {
            Ok(chunks) => chunks.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ChunkSink for CollectorSink {
    fn handle(&mut self, chunk: Chunk) -> crate::error::Result<()> {
        match self.chunks.lock() {
            Ok(mut chunks) => chunks.push(chunk),
            Err(poisoned) => poisoned.into_inner().push(chunk),
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "collector"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::ProcessingMetrics;

    fn chunk(index: u64) -> Chunk {
        Chunk {
            id: format!("s-{index}"),
            index,
            stream_id: "s".to_string(),
            start_time: 0.0,
            end_time: 0.0,
            duration: 0.0,
            original_size: 0,
            processed_size: 0,
            noise_removed: 0,
            average_vad: 0.0,
            vad_timeline: Vec::new(),
            segments: Vec::new(),
            samples: Vec::new(),
            sample_rate: 16_000,
            metrics: ProcessingMetrics::default(),
            is_valid: false,
            error_message: None,
        }
    }

    #[test]
    fn test_channel_sink_forwards() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut sink = ChannelSink::new(tx);
        sink.handle(chunk(0)).unwrap();
        sink.handle(chunk(1)).unwrap();

        let received: Vec<u64> = rx.try_iter().map(|c| c.index).collect();
        assert_eq!(received, vec![0, 1]);
    }

    #[test]
    fn test_channel_sink_without_receiver_is_ok() {
        let (tx, rx) = crossbeam_channel::unbounded();
        drop(rx);
        let mut sink = ChannelSink::new(tx);
        assert!(sink.handle(chunk(0)).is_ok());
    }

    #[test]
    fn test_callback_sink_calls_closure() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let mut sink = CallbackSink::new(move |c: Chunk| seen_clone.lock().unwrap().push(c.id));

        sink.handle(chunk(3)).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["s-3".to_string()]);
        assert_eq!(sink.name(), "callback");
    }

    #[test]
    fn test_collector_sink_shares_storage() {
        let collector = CollectorSink::new();
        let mut sink = collector.clone();
        assert!(collector.is_empty());

        sink.handle(chunk(0)).unwrap();
        sink.handle(chunk(1)).unwrap();
        assert_eq!(collector.len(), 2);
        assert_eq!(collector.chunks()[1].index, 1);
    }
}
