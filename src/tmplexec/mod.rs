//! Template engines and the executer that drives one scan unit.
//!
//! An engine decides in which order a template's compiled requests run and
//! what counts as a match: [`Generic`] runs them in declared order,
//! [`MultiProtocol`] threads extracted values through the shared context, and
//! [`FlowExecutor`] hands control to a script. [`TemplateExecuter`] owns the
//! part every engine shares: the host error check, the per-scan context
//! lifecycle and writing result events.

pub mod flow;
mod generic;
mod multiproto;

pub use flow::FlowExecutor;
pub use generic::Generic;
pub use multiproto::MultiProtocol;

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::TemplarError;
use crate::output::{InternalWrappedEvent, OutputWriter};
use crate::protocols::{ExecutorOptions, MetaInput, Request, ScanContext};

/// Compiled requests of one template, in declared order.
pub type RequestQueue = Vec<Arc<dyn Request>>;

#[async_trait]
pub trait TemplateEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Engine-specific compilation. Requests are already compiled.
    fn compile(&mut self) -> Result<(), TemplarError>;

    /// Run the template against `scan.input`, passing every response event to
    /// `callback`. Returns whether the template matched.
    async fn execute_with_results(
        &self,
        scan: &ScanContext,
        callback: &mut (dyn FnMut(InternalWrappedEvent) + Send),
    ) -> Result<bool, TemplarError>;
}

/// Merge the dynamic values of `event` into the scan context, unprefixed.
pub(crate) fn publish_dynamic_values(scan: &ScanContext, event: &InternalWrappedEvent) {
    if let Some(result) = &event.operators_result {
        if !result.dynamic_values.is_empty() {
            scan.ctx.merge(&result.dynamic_map());
        }
    }
}

/// Removes the scan unit's context when execution ends, however it ends.
struct ContextGuard<'a> {
    options: &'a ExecutorOptions,
    input: &'a MetaInput,
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        self.options.remove_template_ctx(self.input);
    }
}

/// Drives one template engine for one target at a time.
pub struct TemplateExecuter {
    engine: Box<dyn TemplateEngine>,
    options: Arc<ExecutorOptions>,
    requests: usize,
}

impl TemplateExecuter {
    pub fn new(engine: Box<dyn TemplateEngine>, options: Arc<ExecutorOptions>, requests: usize) -> Self {
        Self { engine, options, requests }
    }

    pub fn compile(&mut self) -> Result<(), TemplarError> {
        self.engine.compile()
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    pub fn options(&self) -> &Arc<ExecutorOptions> {
        &self.options
    }

    /// Total requests issued per target.
    pub fn requests(&self) -> usize {
        self.requests
    }

    /// Execute against `input`, writing result events to `output`. Returns
    /// whether the template matched. Fails with `HostSkipped` without sending
    /// anything once the host is over its error threshold.
    pub async fn execute(
        &self,
        input: &MetaInput,
        cancel: &CancellationToken,
        output: &dyn OutputWriter,
    ) -> Result<bool, TemplarError> {
        self.options.check_host(input)?;

        let ctx = self.options.get_template_ctx(input);
        let _guard = ContextGuard { options: &self.options, input };
        let scan = ScanContext::new(input.clone(), ctx, cancel.clone());

        let template_id = &self.options.template_id;
        let mut written = 0usize;
        let mut callback = |event: InternalWrappedEvent| {
            if cancel.is_cancelled() {
                return;
            }
            for result in &event.results {
                match output.write(result) {
                    Ok(()) => written += 1,
                    Err(e) => warn!(template_id = %template_id, target = %input, error = %e, "Failed to write result"),
                }
            }
        };
        let matched = self.engine.execute_with_results(&scan, &mut callback).await?;

        debug!(
            template_id = %template_id,
            target = %input,
            engine = self.engine.name(),
            matched,
            results = written,
            "Template executed"
        );
        Ok(matched || written > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::MemoryWriter;
    use crate::protocols::http::HttpRequest;
    use crate::protocols::testutil::{executor_options, http_fixture};

    fn http_request(options: &Arc<ExecutorOptions>, yaml: &str) -> Arc<dyn Request> {
        let mut request: HttpRequest = serde_yaml::from_str(yaml).unwrap();
        request.compile(Arc::clone(options)).unwrap();
        Arc::new(request)
    }

    #[tokio::test]
    async fn test_executer_writes_results_and_frees_context() {
        let base = http_fixture(|_| (200, "welcome admin".to_string())).await;
        let options = Arc::new(executor_options("exec-test"));
        let request = http_request(&options, "path: ['{{BaseURL}}/']\nmatchers:\n  - type: word\n    words: [admin]\n");
        let engine = Generic::new(vec![request], Arc::clone(&options));
        let executer = TemplateExecuter::new(Box::new(engine), Arc::clone(&options), 1);

        let output = MemoryWriter::new();
        let input = MetaInput::new(base);
        let matched = executer.execute(&input, &CancellationToken::new(), &output).await.unwrap();
        assert!(matched);
        assert_eq!(output.len(), 1);
        assert_eq!(output.events()[0].template_id, "exec-test");
        assert_eq!(options.active_contexts(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_scan_writes_nothing() {
        let base = http_fixture(|_| (200, "welcome admin".to_string())).await;
        let options = Arc::new(executor_options("exec-cancel"));
        let request = http_request(&options, "path: ['{{BaseURL}}/']\nmatchers:\n  - type: word\n    words: [admin]\n");
        let executer = TemplateExecuter::new(Box::new(Generic::new(vec![request], Arc::clone(&options))), options, 1);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let output = MemoryWriter::new();
        let result = executer.execute(&MetaInput::new(base), &cancel, &output).await;
        assert!(matches!(result, Err(TemplarError::Cancelled(_))));
        assert!(output.is_empty());
    }
}
