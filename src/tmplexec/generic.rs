use async_trait::async_trait;
use serde_json::Map;
use std::sync::Arc;

use super::{RequestQueue, TemplateEngine};
use crate::errors::TemplarError;
use crate::output::{InternalEvent, InternalWrappedEvent};
use crate::protocols::{ExecutorOptions, ScanContext};

/// Runs every request in declared order against the raw input. Nothing is
/// passed between requests.
pub struct Generic {
    requests: RequestQueue,
    options: Arc<ExecutorOptions>,
}

impl Generic {
    pub fn new(requests: RequestQueue, options: Arc<ExecutorOptions>) -> Self {
        Self { requests, options }
    }
}

#[async_trait]
impl TemplateEngine for Generic {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn compile(&mut self) -> Result<(), TemplarError> {
        if self.requests.is_empty() {
            return Err(TemplarError::Compile(format!("template {} has no requests", self.options.template_id)));
        }
        Ok(())
    }

    async fn execute_with_results(
        &self,
        scan: &ScanContext,
        callback: &mut (dyn FnMut(InternalWrappedEvent) + Send),
    ) -> Result<bool, TemplarError> {
        let mut matched = false;
        let mut last_error = None;
        let empty = Map::new();
        let previous = InternalEvent::new();

        for request in &self.requests {
            let mut on_event = |event: InternalWrappedEvent| {
                if event.has_results() {
                    matched = true;
                }
                callback(event);
            };
            match request.execute_with_results(scan, &empty, &previous, &mut on_event).await {
                Ok(()) => {}
                Err(e @ TemplarError::Cancelled(_)) => return Err(e),
                Err(e) => last_error = Some(e),
            }
            if matched && self.options.stop_at_first_match {
                break;
            }
        }

        match last_error {
            Some(e) if !matched => Err(e),
            _ => Ok(matched),
        }
    }
}
