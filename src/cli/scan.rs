use anyhow::{bail, Context};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use templar::config::EngineOptions;
use templar::core::{Engine, OutputPipeline};
use templar::interactsh::InteractshClient;
use templar::output::{JsonLinesWriter, OutputWriter};
use templar::protocols::{MetaInput, ProtocolResources};
use templar::reporting::{MarkdownExporter, Reporter, ReportingClient};
use templar::templates::load_templates;

use super::commands::ScanArgs;

pub async fn handle_scan(args: ScanArgs) -> anyhow::Result<()> {
    let mut options = super::load_options(args.config.as_deref()).await?;
    apply_overrides(&mut options, &args);
    let options = Arc::new(options);

    let sink: Arc<dyn OutputWriter> = match &args.output {
        Some(path) => Arc::new(
            JsonLinesWriter::file(Path::new(path)).with_context(|| format!("Failed to open output {}", path))?,
        ),
        None => Arc::new(JsonLinesWriter::stdout()),
    };
    let mut clients: Vec<Arc<dyn ReportingClient>> = Vec::new();
    if let Some(path) = &args.report {
        clients.push(Arc::new(MarkdownExporter::new(path)));
    }
    let pipeline = OutputPipeline::spawn(sink, Reporter::new(clients));

    let mut resources = ProtocolResources::new(Arc::clone(&options), super::catalog(&options));
    let mut interactsh = None;
    if !options.interactsh.no_interactsh {
        match InteractshClient::new(options.interactsh.clone(), pipeline.writer()).await {
            Ok(client) => {
                let client = Arc::new(client);
                client.start_polling();
                resources = resources.with_interactsh(Arc::clone(&client));
                interactsh = Some(client);
            }
            Err(e) => warn!(error = %e, "Interaction correlation unavailable, continuing without it"),
        }
    }

    let report = load_templates(&args.templates, &resources).context("Failed to expand template inputs")?;
    if report.is_empty() {
        bail!("No templates loaded ({} failed, {} filtered)", report.errors.len(), report.filtered);
    }
    let templates = report.templates.into_iter().map(Arc::new).collect();

    let targets = collect_targets(&args).await?;
    if targets.is_empty() {
        bail!("No targets given; use --target or --list");
    }

    let cancel = CancellationToken::new();
    let watcher = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping scan");
            watcher.cancel();
        }
    });

    let engine = Engine::new(Arc::clone(&options), pipeline.writer());
    let summary = engine.execute(templates, targets, cancel).await;

    if let Some(client) = interactsh {
        client.close().await;
        info!(matched = client.matched(), pending = client.pending(), "Interaction correlation finished");
    }
    let written = pipeline.finish().await;

    info!(
        matched = summary.matched,
        errored = summary.errored,
        host_skipped = summary.host_skipped,
        completed = summary.completed,
        results = written,
        "Scan completed"
    );
    Ok(())
}

fn apply_overrides(options: &mut EngineOptions, args: &ScanArgs) {
    if let Some(rate_limit) = args.rate_limit {
        options.rate_limit = rate_limit;
    }
    if let Some(timeout) = args.timeout {
        options.timeout = Duration::from_secs(timeout.max(1));
    }
    if let Some(n) = args.template_concurrency {
        options.template_concurrency = n.max(1);
    }
    if let Some(n) = args.host_concurrency {
        options.host_concurrency = n.max(1);
    }
    if args.stop_at_first_match {
        options.stop_at_first_match = true;
    }
    if args.no_interactsh {
        options.interactsh.no_interactsh = true;
    }

    let cli = &args.filters;
    let filters = &mut options.filters;
    filters.tags.extend(cli.tags.iter().cloned());
    filters.exclude_tags.extend(cli.exclude_tags.iter().cloned());
    filters.include_tags.extend(cli.include_tags.iter().cloned());
    filters.ids.extend(cli.ids.iter().cloned());
    filters.exclude_ids.extend(cli.exclude_ids.iter().cloned());
    filters.authors.extend(cli.authors.iter().cloned());
    filters.severities.extend(cli.severities.iter().copied());
    filters.exclude_severities.extend(cli.exclude_severities.iter().copied());
    filters.protocol_types.extend(cli.protocol_types.iter().copied());
    filters.exclude_protocol_types.extend(cli.exclude_protocol_types.iter().copied());
}

async fn collect_targets(args: &ScanArgs) -> anyhow::Result<Vec<MetaInput>> {
    let mut raw: Vec<String> = args.targets.clone();
    if let Some(list) = &args.list {
        let content = tokio::fs::read_to_string(list)
            .await
            .with_context(|| format!("Failed to read target list {}", list))?;
        raw.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(String::from),
        );
    }
    let mut seen = std::collections::HashSet::new();
    raw.retain(|target| seen.insert(target.clone()));
    Ok(raw.into_iter().map(MetaInput::new).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::commands::{Cli, Commands};
    use clap::Parser;
    use templar::models::Severity;
    use templar::protocols::ProtocolType;

    fn scan_args(argv: &[&str]) -> ScanArgs {
        match Cli::parse_from(argv).command {
            Commands::Scan(args) => args,
            _ => panic!("expected scan"),
        }
    }

    #[test]
    fn test_filter_flags_reach_engine_options() {
        let args = scan_args(&[
            "templar", "scan", "-t", "templates", "--tags", "cve,rce", "--exclude-tags", "dos",
            "--severity", "high", "--severity", "critical", "--exclude-severity", "info", "--id", "a,b",
            "--author", "alice", "--type", "dns", "--exclude-type", "tcp",
        ]);
        let mut options = EngineOptions::for_tests();
        options.filters.tags.push("from-config".into());
        apply_overrides(&mut options, &args);

        let filters = &options.filters;
        assert_eq!(filters.tags, vec!["from-config", "cve", "rce"]);
        assert_eq!(filters.exclude_tags, vec!["dos"]);
        assert_eq!(filters.severities, vec![Severity::High, Severity::Critical]);
        assert_eq!(filters.exclude_severities, vec![Severity::Info]);
        assert_eq!(filters.ids, vec!["a", "b"]);
        assert_eq!(filters.authors, vec!["alice"]);
        assert_eq!(filters.protocol_types, vec![ProtocolType::Dns]);
        assert_eq!(filters.exclude_protocol_types, vec![ProtocolType::Network]);
    }

    #[test]
    fn test_no_filter_flags_leave_filters_empty() {
        let args = scan_args(&["templar", "scan", "-t", "templates", "-u", "http://a.test"]);
        let mut options = EngineOptions::for_tests();
        apply_overrides(&mut options, &args);
        assert!(options.filters.is_empty());
    }
}
