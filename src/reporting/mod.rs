//! Issue-tracker style consumers of result events. Failures here are logged
//! and never affect scanning.

pub mod formatter;
pub mod markdown;

pub use markdown::MarkdownExporter;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

use crate::errors::TemplarError;
use crate::output::ResultEvent;

#[async_trait]
pub trait ReportingClient: Send + Sync {
    /// Client name for logging
    fn name(&self) -> &str;

    async fn create_issue(&self, event: &ResultEvent) -> Result<(), TemplarError>;

    /// Flush anything buffered. Called once when the scan finishes.
    async fn close(&self) -> Result<(), TemplarError> {
        Ok(())
    }
}

/// Fans result events out to every configured client.
#[derive(Clone, Default)]
pub struct Reporter {
    clients: Vec<Arc<dyn ReportingClient>>,
}

impl Reporter {
    pub fn new(clients: Vec<Arc<dyn ReportingClient>>) -> Self {
        Self { clients }
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub async fn report(&self, event: &ResultEvent) {
        for client in &self.clients {
            if let Err(e) = client.create_issue(event).await {
                warn!(client = client.name(), template_id = %event.template_id, error = %e, "Failed to create issue");
            }
        }
    }

    pub async fn close(&self) {
        for client in &self.clients {
            if let Err(e) = client.close().await {
                warn!(client = client.name(), error = %e, "Failed to close reporting client");
            }
        }
    }
}
