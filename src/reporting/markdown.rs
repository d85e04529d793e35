use async_trait::async_trait;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::info;

use super::formatter::{format_executive_summary, format_result_markdown};
use super::ReportingClient;
use crate::errors::TemplarError;
use crate::output::ResultEvent;

/// Collects findings and writes a markdown report, ordered by severity, when
/// the scan closes.
pub struct MarkdownExporter {
    path: PathBuf,
    events: Mutex<Vec<ResultEvent>>,
}

impl MarkdownExporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), events: Mutex::new(Vec::new()) }
    }
}

#[async_trait]
impl ReportingClient for MarkdownExporter {
    fn name(&self) -> &str {
        "markdown"
    }

    async fn create_issue(&self, event: &ResultEvent) -> Result<(), TemplarError> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), TemplarError> {
        let mut events = self.events.lock().await.clone();
        events.sort_by_key(|e| (e.info.severity.rank(), e.template_id.clone()));

        let mut report = String::from("# Scan Report\n\n");
        report.push_str(&format_executive_summary(&events));
        for event in &events {
            report.push_str("\n---\n\n");
            report.push_str(&format_result_markdown(event));
        }
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, &report).await?;
        info!(path = %self.path.display(), findings = events.len(), "Markdown report written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Severity;
    use crate::reporting::tests::sample_event;

    #[tokio::test]
    async fn test_report_sorted_by_severity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/report.md");
        let exporter = MarkdownExporter::new(&path);

        let low = sample_event();
        let mut critical = sample_event();
        critical.template_id = "rce".into();
        critical.info.name = "Remote Code Execution".into();
        critical.info.severity = Severity::Critical;
        exporter.create_issue(&low).await.unwrap();
        exporter.create_issue(&critical).await.unwrap();
        exporter.close().await.unwrap();

        let report = std::fs::read_to_string(&path).unwrap();
        let rce = report.find("Remote Code Execution").unwrap();
        let panel = report.find("Exposed Panel").unwrap();
        assert!(rce < panel);
        assert!(report.contains("| Critical | 1 |"));
    }
}
