//! Concurrent execution of (target × template) scan units.

mod output;

pub use output::OutputPipeline;

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EngineOptions;
use crate::errors::TemplarError;
use crate::output::OutputWriter;
use crate::protocols::MetaInput;
use crate::templates::Template;

/// Outcome counts of one engine run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionSummary {
    /// Scan units that matched.
    pub matched: usize,
    /// Scan units that ended with an error.
    pub errored: usize,
    /// Scan units skipped because their host went over the error threshold.
    pub host_skipped: usize,
    /// Scan units executed, whatever the outcome.
    pub completed: usize,
}

#[derive(Default)]
struct Counters {
    matched: AtomicUsize,
    errored: AtomicUsize,
    host_skipped: AtomicUsize,
    completed: AtomicUsize,
}

impl Counters {
    fn summary(&self) -> ExecutionSummary {
        ExecutionSummary {
            matched: self.matched.load(Ordering::Relaxed),
            errored: self.errored.load(Ordering::Relaxed),
            host_skipped: self.host_skipped.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
        }
    }
}

/// Runs every template against every target. Templates run in parallel up
/// to `template_concurrency`; each template runs its targets in parallel up
/// to `host_concurrency`.
pub struct Engine {
    options: Arc<EngineOptions>,
    output: Arc<dyn OutputWriter>,
}

impl Engine {
    pub fn new(options: Arc<EngineOptions>, output: Arc<dyn OutputWriter>) -> Self {
        Self { options, output }
    }

    pub async fn execute(
        &self,
        templates: Vec<Arc<Template>>,
        targets: Vec<MetaInput>,
        cancel: CancellationToken,
    ) -> ExecutionSummary {
        let counters = Arc::new(Counters::default());
        let targets = Arc::new(targets);
        let template_slots = Arc::new(Semaphore::new(self.options.template_concurrency.max(1)));
        let host_concurrency = self.options.host_concurrency.max(1);

        info!(
            templates = templates.len(),
            targets = targets.len(),
            template_concurrency = self.options.template_concurrency,
            host_concurrency,
            "Scan started"
        );

        let handles: Vec<_> = templates
            .into_iter()
            .map(|template| {
                let template_slots = Arc::clone(&template_slots);
                let targets = Arc::clone(&targets);
                let counters = Arc::clone(&counters);
                let output = Arc::clone(&self.output);
                let cancel = cancel.clone();

                tokio::spawn(async move {
                    let Ok(_slot) = template_slots.acquire_owned().await else {
                        return;
                    };
                    let host_slots = Arc::new(Semaphore::new(host_concurrency));
                    let units: Vec<_> = targets
                        .iter()
                        .cloned()
                        .map(|input| {
                            let template = Arc::clone(&template);
                            let host_slots = Arc::clone(&host_slots);
                            let counters = Arc::clone(&counters);
                            let output = Arc::clone(&output);
                            let cancel = cancel.clone();
                            tokio::spawn(async move {
                                let Ok(_slot) = host_slots.acquire_owned().await else {
                                    return;
                                };
                                if cancel.is_cancelled() {
                                    return;
                                }
                                run_unit(&template, &input, &cancel, output.as_ref(), &counters).await;
                            })
                        })
                        .collect();
                    for (i, result) in futures::future::join_all(units).await.into_iter().enumerate() {
                        if let Err(e) = result {
                            error!(template_id = %template.id, unit = i, error = %e, "Scan unit task panicked");
                        }
                    }
                })
            })
            .collect();

        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "Template task panicked");
            }
        }

        let summary = counters.summary();
        info!(
            matched = summary.matched,
            errored = summary.errored,
            host_skipped = summary.host_skipped,
            completed = summary.completed,
            "Scan finished"
        );
        summary
    }
}

async fn run_unit(
    template: &Template,
    input: &MetaInput,
    cancel: &CancellationToken,
    output: &dyn OutputWriter,
    counters: &Counters,
) {
    let result = template.executer.execute(input, cancel, output).await;
    counters.completed.fetch_add(1, Ordering::Relaxed);
    match result {
        Ok(true) => {
            counters.matched.fetch_add(1, Ordering::Relaxed);
        }
        Ok(false) => {}
        Err(TemplarError::HostSkipped(host)) => {
            counters.host_skipped.fetch_add(1, Ordering::Relaxed);
            debug!(template_id = %template.id, target = %input, host = %host, "Skipped due to host errors");
        }
        Err(TemplarError::Cancelled(_)) => {}
        Err(e) => {
            counters.errored.fetch_add(1, Ordering::Relaxed);
            let classification = e.classify();
            warn!(
                template_id = %template.id,
                target = %input,
                error_type = classification.error_type,
                error = %e,
                "Scan unit failed"
            );
        }
    }
}
