use async_trait::async_trait;
use serde_json::Map;
use std::sync::Arc;
use tracing::debug;

use super::{publish_dynamic_values, RequestQueue, TemplateEngine};
use crate::errors::TemplarError;
use crate::output::{InternalEvent, InternalWrappedEvent};
use crate::protocols::{ExecutorOptions, ScanContext};

/// Runs requests of several protocols in declared order, one after another.
///
/// Each backend publishes its response fields into the scan context under its
/// id or protocol prefix; dynamic values extracted by a step are merged in
/// unprefixed. Template variables are re-evaluated against the context for
/// every step, so a later step sees everything earlier steps produced.
pub struct MultiProtocol {
    requests: RequestQueue,
    options: Arc<ExecutorOptions>,
}

impl MultiProtocol {
    pub fn new(requests: RequestQueue, options: Arc<ExecutorOptions>) -> Self {
        Self { requests, options }
    }
}

#[async_trait]
impl TemplateEngine for MultiProtocol {
    fn name(&self) -> &'static str {
        "multiprotocol"
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

        for (index, request) in self.requests.iter().enumerate() {
            if scan.cancel.is_cancelled() {
                return Err(TemplarError::Cancelled("scan cancelled".into()));
            }
            let mut step_results = 0usize;
            let mut on_event = |event: InternalWrappedEvent| {
                publish_dynamic_values(scan, &event);
                step_results += event.results.len();
                callback(event);
            };
            match request.execute_with_results(scan, &empty, &previous, &mut on_event).await {
                Ok(()) => {}
                Err(e @ (TemplarError::Cancelled(_) | TemplarError::HostSkipped(_))) => return Err(e),
                Err(e) => last_error = Some(e),
            }
            debug!(
                template_id = %self.options.template_id,
                target = %scan.input,
                step = index + 1,
                protocol = %request.protocol(),
                results = step_results,
                "Protocol step finished"
            );
            matched |= step_results > 0;
        }

        match last_error {
            Some(e) if !matched => Err(e),
            _ => Ok(matched),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::dns::DnsRequest;
    use crate::protocols::http::HttpRequest;
    use crate::protocols::testutil::{dns_fixture, executor_options, http_fixture, request_path};
    use crate::protocols::Request;
    use std::collections::HashMap;

    fn multi_options(id: &str) -> Arc<ExecutorOptions> {
        let mut options = executor_options(id);
        options.is_multi_protocol = true;
        Arc::new(options)
    }

    #[tokio::test]
    async fn test_dns_answer_feeds_http_step() {
        let resolver = dns_fixture(HashMap::from([("app.test".to_string(), [10, 9, 8, 7])])).await;
        let base = http_fixture(|head| (200, format!("seen {}", request_path(head)))).await;
        let options = multi_options("multi-dns-http");

        let mut dns: DnsRequest = serde_yaml::from_str(&format!(
            "name: app.test\nresolvers: ['{}']\nextractors:\n  - type: regex\n    name: addr\n    internal: true\n    part: a\n    regex: ['[0-9.]+']\n",
            resolver
        ))
        .unwrap();
        dns.compile(Arc::clone(&options)).unwrap();
        let mut http: HttpRequest = serde_yaml::from_str(&format!(
            "path: ['{}/lookup?ip={{{{addr}}}}&a={{{{dns_a}}}}']\nmatchers:\n  - type: word\n    words: ['ip=10.9.8.7&a=10.9.8.7']\n",
            base
        ))
        .unwrap();
        http.compile(Arc::clone(&options)).unwrap();

        let engine = MultiProtocol::new(vec![Arc::new(dns), Arc::new(http)], Arc::clone(&options));
        let scan = ScanContext::detached(base.as_str());
        let mut events = Vec::new();
        let matched = engine.execute_with_results(&scan, &mut |e| events.push(e)).await.unwrap();

        assert!(matched);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].field("body"), "seen /lookup?ip=10.9.8.7&a=10.9.8.7");
        assert!(scan.ctx.has("http_status_code"));
    }

    #[tokio::test]
    async fn test_failed_step_does_not_block_later_steps() {
        let base = http_fixture(|_| (200, "fine".to_string())).await;
        let options = multi_options("multi-continue");
        let mut broken: HttpRequest = serde_yaml::from_str("path: ['{{BaseURL}}/{{never_set}}']\n").unwrap();
        broken.compile(Arc::clone(&options)).unwrap();
        let mut ok: HttpRequest =
            serde_yaml::from_str("path: ['{{BaseURL}}/']\nmatchers:\n  - type: word\n    words: [fine]\n").unwrap();
        ok.compile(Arc::clone(&options)).unwrap();

        let engine = MultiProtocol::new(vec![Arc::new(broken), Arc::new(ok)], options);
        let scan = ScanContext::detached(base.as_str());
        let matched = engine.execute_with_results(&scan, &mut |_| {}).await.unwrap();
        assert!(matched);
    }
}
