use std::io::Write;
use std::sync::Mutex;
use tokio::sync::mpsc;

use super::ResultEvent;
use crate::errors::TemplarError;

/// Receives one call per synthesized result. Implementations must not block
/// for long; slow sinks should buffer.
pub trait OutputWriter: Send + Sync {
    fn write(&self, event: &ResultEvent) -> Result<(), TemplarError>;

    fn close(&self) {}
}

/// Writes each event as one JSON document per line.
pub struct JsonLinesWriter {
    out: Mutex<Box<dyn Write + Send>>,
}

impl JsonLinesWriter {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self { out: Mutex::new(out) }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    pub fn file(path: &std::path::Path) -> Result<Self, TemplarError> {
        let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(Box::new(std::io::BufWriter::new(file))))
    }
}

impl OutputWriter for JsonLinesWriter {
    fn write(&self, event: &ResultEvent) -> Result<(), TemplarError> {
        let line = serde_json::to_string(event)?;
        let mut out = self.out.lock().map_err(|_| TemplarError::Internal("output writer lock poisoned".into()))?;
        writeln!(out, "{}", line)?;
        Ok(())
    }

    fn close(&self) {
        if let Ok(mut out) = self.out.lock() {
            let _ = out.flush();
        }
    }
}

/// Collects events in memory.
#[derive(Default)]
pub struct MemoryWriter {
    events: Mutex<Vec<ResultEvent>>,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ResultEvent> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|events| events.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl OutputWriter for MemoryWriter {
    fn write(&self, event: &ResultEvent) -> Result<(), TemplarError> {
        self.events
            .lock()
            .map_err(|_| TemplarError::Internal("memory writer lock poisoned".into()))?
            .push(event.clone());
        Ok(())
    }
}

/// Forwards events to an async consumer.
pub struct ChannelWriter {
    sender: mpsc::UnboundedSender<ResultEvent>,
}

impl ChannelWriter {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ResultEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl OutputWriter for ChannelWriter {
    fn write(&self, event: &ResultEvent) -> Result<(), TemplarError> {
        self.sender
            .send(event.clone())
            .map_err(|_| TemplarError::Internal("output channel closed".into()))
    }
}
