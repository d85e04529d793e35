use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::output::{ChannelWriter, OutputWriter, ResultEvent};
use crate::reporting::Reporter;

/// Moves result events off the scanning tasks: executers write to a channel,
/// one task forwards to the output sink and the reporting clients.
pub struct OutputPipeline {
    writer: Arc<ChannelWriter>,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<usize>,
}

async fn deliver(event: ResultEvent, sink: &dyn OutputWriter, reporter: &Reporter) -> bool {
    let written = match sink.write(&event) {
        Ok(()) => true,
        Err(e) => {
            warn!(template_id = %event.template_id, target = %event.host, error = %e, "Failed to write result");
            false
        }
    };
    if !reporter.is_empty() {
        reporter.report(&event).await;
    }
    written
}

async fn consume(
    mut events: mpsc::UnboundedReceiver<ResultEvent>,
    mut shutdown: oneshot::Receiver<()>,
    sink: Arc<dyn OutputWriter>,
    reporter: Reporter,
) -> usize {
    let mut written = 0;
    loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Some(event) => written += usize::from(deliver(event, sink.as_ref(), &reporter).await),
                None => break,
            },
            _ = &mut shutdown => {
                while let Ok(event) = events.try_recv() {
                    written += usize::from(deliver(event, sink.as_ref(), &reporter).await);
                }
                break;
            }
        }
    }
    sink.close();
    reporter.close().await;
    written
}

impl OutputPipeline {
    pub fn spawn(sink: Arc<dyn OutputWriter>, reporter: Reporter) -> Self {
        let (writer, events) = ChannelWriter::channel();
        let (shutdown, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(consume(events, shutdown_rx, sink, reporter));
        Self { writer: Arc::new(writer), shutdown, handle }
    }

    /// Writer to hand to the engine and the interaction client.
    pub fn writer(&self) -> Arc<dyn OutputWriter> {
        self.writer.clone()
    }

    /// Deliver everything already queued, close the sink and the reporting
    /// clients. Returns the number of events written to the sink.
    pub async fn finish(self) -> usize {
        let _ = self.shutdown.send(());
        match self.handle.await {
            Ok(written) => written,
            Err(e) => {
                error!(error = %e, "Output task panicked");
                0
            }
        }
    }
}
