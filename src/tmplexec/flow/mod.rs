//! Script-driven execution.
//!
//! The script decides which requests run and in what order; the engine only
//! executes what the script asks for. Scripts are JavaScript evaluated on a
//! blocking thread; each protocol call in the script becomes an
//! [`Invocation`] the async side executes to completion before the script
//! resumes, so request N always sees the context writes of request N-1.

pub mod host;

pub use host::{check_syntax, ChannelHost, FlowEnv, FlowHost, Invocation, Selector, PROTOCOL_FUNCTIONS};

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use super::{publish_dynamic_values, RequestQueue, TemplateEngine};
use crate::errors::TemplarError;
use crate::output::{InternalEvent, InternalWrappedEvent};
use crate::protocols::{ExecutorOptions, Request, ScanContext};

pub struct FlowExecutor {
    requests: RequestQueue,
    options: Arc<ExecutorOptions>,
    source: Arc<str>,
    compiled: bool,
}

impl FlowExecutor {
    pub fn new(requests: RequestQueue, options: Arc<ExecutorOptions>, source: impl Into<String>) -> Self {
        Self { requests, options, source: Arc::from(source.into()), compiled: false }
    }

    fn select(&self, selector: &Selector) -> Result<Vec<&Arc<dyn Request>>, TemplarError> {
        let protocol = selector.protocol();
        let mut of_protocol = self.requests.iter().filter(|r| r.protocol() == protocol);
        let selected: Vec<_> = match selector {
            Selector::All(_) => of_protocol.collect(),
            Selector::Index(_, n) => of_protocol.nth(n - 1).into_iter().collect(),
            Selector::Id(_, id) => of_protocol.filter(|r| r.id() == Some(id.as_str())).collect(),
        };
        if selected.is_empty() {
            return Err(TemplarError::Flow(format!(
                "template {} has no request matching {}",
                self.options.template_id, selector
            )));
        }
        Ok(selected)
    }

    /// Execute the selected requests. A request with no matchers counts as
    /// matched when it ran without error.
    async fn invoke(
        &self,
        scan: &ScanContext,
        selector: &Selector,
        collected: &mut Vec<InternalWrappedEvent>,
    ) -> Result<bool, TemplarError> {
        if scan.cancel.is_cancelled() {
            return Err(TemplarError::Cancelled("scan cancelled".into()));
        }
        let mut matched = false;
        for request in self.select(selector)? {
            let mut step_matched = false;
            let mut on_event = |event: InternalWrappedEvent| {
                publish_dynamic_values(scan, &event);
                step_matched |= event.matched();
                collected.push(event);
            };
            let outcome = request
                .execute_with_results(scan, &Map::new(), &InternalEvent::new(), &mut on_event)
                .await;
            match outcome {
                Ok(()) => step_matched |= !request.operators().has_matchers(),
                Err(e @ TemplarError::Cancelled(_)) => return Err(e),
                Err(e) => debug!(
                    template_id = %self.options.template_id,
                    target = %scan.input,
                    request = %selector,
                    error = %e,
                    "Flow step failed"
                ),
            }
            matched |= step_matched;
        }
        Ok(matched)
    }
}

#[async_trait]
impl TemplateEngine for FlowExecutor {
    fn name(&self) -> &'static str {
        "flow"
    }

    /// Check the script's syntax and that every protocol it calls is
    /// declared by the template.
    fn compile(&mut self) -> Result<(), TemplarError> {
        let template_id = &self.options.template_id;
        check_syntax(&self.source)
            .map_err(|e| TemplarError::Compile(format!("template {}: invalid flow: {}", template_id, e)))?;
        let calls = Regex::new(&format!(r"\b({})\s*\(", PROTOCOL_FUNCTIONS.join("|")))
            .map_err(|e| TemplarError::Internal(e.to_string()))?;
        for call in calls.captures_iter(&self.source) {
            let name = &call[1];
            let Some(protocol) = Selector::protocol_of(name) else { continue };
            if !self.requests.iter().any(|r| r.protocol() == protocol) {
                return Err(TemplarError::Compile(format!(
                    "template {}: flow calls {}() but declares no {} requests",
                    template_id, name, protocol
                )));
            }
        }
        self.compiled = true;
        Ok(())
    }

    /// The outcome is the script's completion value when boolean, else
    /// whether any invoked request matched.
    /// Events are passed on only when the outcome is true.
    async fn execute_with_results(
        &self,
        scan: &ScanContext,
        callback: &mut (dyn FnMut(InternalWrappedEvent) + Send),
    ) -> Result<bool, TemplarError> {
        if !self.compiled {
            return Err(TemplarError::Internal("flow executed before compile".into()));
        }
        let source = Arc::clone(&self.source);

        let (sender, mut invocations) = mpsc::channel::<Invocation>(1);
        let host = ChannelHost::new(scan.ctx.clone(), sender, self.options.template_id.clone());
        let interpreter = tokio::task::spawn_blocking(move || {
            let mut env = FlowEnv::new(host)?;
            env.run(&source)
        });

        let mut collected = Vec::new();
        let mut any_matched = false;
        while let Some(invocation) = invocations.recv().await {
            let outcome = self.invoke(scan, &invocation.selector, &mut collected).await;
            any_matched |= matches!(outcome, Ok(true));
            let _ = invocation.reply.send(outcome);
        }

        let completion = interpreter
            .await
            .map_err(|e| TemplarError::Internal(format!("flow interpreter panicked: {}", e)))?;
        let completion = match completion {
            Ok(value) => value,
            Err(e @ TemplarError::Cancelled(_)) => return Err(e),
            Err(_) if scan.cancel.is_cancelled() => return Err(TemplarError::Cancelled("scan cancelled".into())),
            Err(e) => {
                return Err(TemplarError::Flow(format!(
                    "template {} on {}: {}",
                    self.options.template_id, scan.input, e
                )))
            }
        };

        let outcome = match completion {
            Value::Bool(value) => value,
            _ => any_matched,
        };
        if outcome {
            collected.into_iter().for_each(|event| callback(event));
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::dns::DnsRequest;
    use crate::protocols::http::HttpRequest;
    use crate::protocols::testutil::{dns_fixture, executor_options, http_fixture, request_path};
    use std::collections::HashMap;
    use std::net::SocketAddr;

    fn flow_options(id: &str, flow: &str) -> Arc<ExecutorOptions> {
        let mut options = executor_options(id);
        options.flow = Some(flow.to_string());
        Arc::new(options)
    }

    fn dns_request(options: &Arc<ExecutorOptions>, resolver: SocketAddr, extra: &str) -> Arc<dyn Request> {
        let mut request: DnsRequest =
            serde_yaml::from_str(&format!("name: app.test\nresolvers: ['{}']\n{}", resolver, extra)).unwrap();
        request.compile(Arc::clone(options)).unwrap();
        Arc::new(request)
    }

    fn http_request(options: &Arc<ExecutorOptions>, yaml: &str) -> Arc<dyn Request> {
        let mut request: HttpRequest = serde_yaml::from_str(yaml).unwrap();
        request.compile(Arc::clone(options)).unwrap();
        Arc::new(request)
    }

    fn engine(options: &Arc<ExecutorOptions>, requests: RequestQueue) -> FlowExecutor {
        let flow = options.flow.clone().unwrap_or_default();
        let mut engine = FlowExecutor::new(requests, Arc::clone(options), flow);
        engine.compile().unwrap();
        engine
    }

    async fn run(engine: &FlowExecutor, target: &str) -> (Result<bool, TemplarError>, Vec<InternalWrappedEvent>) {
        let scan = ScanContext::detached(target);
        let mut events = Vec::new();
        let result = engine.execute_with_results(&scan, &mut |e| events.push(e)).await;
        (result, events)
    }

    const A_MATCHER: &str = "matchers:\n  - type: word\n    part: a\n    words: ['10.0.0.1']\n";

    #[tokio::test]
    async fn test_and_of_two_steps() {
        let resolver = dns_fixture(HashMap::from([("app.test".to_string(), [10, 0, 0, 1])])).await;
        let base = http_fixture(|head| (200, request_path(head))).await;
        let options = flow_options("flow-and", "dns() && http()");
        let http = |path: &str| format!("path: ['{{{{BaseURL}}}}{}']\nmatchers:\n  - type: word\n    words: ['/yes']\n", path);

        let positive = engine(&options, vec![dns_request(&options, resolver, A_MATCHER), http_request(&options, &http("/yes"))]);
        let (result, events) = run(&positive, &base).await;
        assert!(result.unwrap());
        assert!(events.iter().any(|e| e.has_results()));

        let negative = engine(&options, vec![dns_request(&options, resolver, A_MATCHER), http_request(&options, &http("/no"))]);
        let (result, events) = run(&negative, &base).await;
        assert!(!result.unwrap());
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_no_matchers_step_is_implicit_success() {
        let resolver = dns_fixture(HashMap::from([("app.test".to_string(), [10, 0, 0, 1])])).await;
        let base = http_fixture(|_| (200, "ok".to_string())).await;
        let options = flow_options("flow-implicit", "dns() && http()");
        let flow = engine(
            &options,
            vec![dns_request(&options, resolver, ""), http_request(&options, "path: ['{{BaseURL}}/']\n")],
        );
        let (result, _) = run(&flow, &base).await;
        assert!(result.unwrap());
    }

    #[tokio::test]
    async fn test_context_written_by_step_is_visible_to_next() {
        let resolver = dns_fixture(HashMap::from([("app.test".to_string(), [10, 0, 0, 1])])).await;
        let base = http_fixture(|head| (200, request_path(head))).await;
        let options = flow_options("flow-ctx", "if (dns()) { set(\"marker\", \"m1\"); http() }");
        let flow = engine(
            &options,
            vec![
                dns_request(&options, resolver, A_MATCHER),
                http_request(
                    &options,
                    "path: ['{{BaseURL}}/{{marker}}/{{dns_a}}']\nmatchers:\n  - type: word\n    words: ['/m1/10.0.0.1']\n",
                ),
            ],
        );
        let (result, events) = run(&flow, &base).await;
        assert!(result.unwrap());
        assert_eq!(events.last().map(|e| e.field("body")).as_deref(), Some("/m1/10.0.0.1"));
    }

    #[tokio::test]
    async fn test_undefined_id_is_a_flow_error() {
        let base = http_fixture(|_| (200, "ok".to_string())).await;
        let options = flow_options("flow-missing", "http(\"nope\")");
        let flow = engine(&options, vec![http_request(&options, "id: real\npath: ['{{BaseURL}}/']\n")]);
        let (result, events) = run(&flow, &base).await;
        assert!(matches!(result, Err(TemplarError::Flow(_))));
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_trailing_boolean_overrides() {
        let base = http_fixture(|_| (200, "ok".to_string())).await;
        let options = flow_options("flow-trailing", "http(\"landing\");\nfalse");
        let flow = engine(
            &options,
            vec![http_request(&options, "id: landing\npath: ['{{BaseURL}}/']\nmatchers:\n  - type: word\n    words: [ok]\n")],
        );
        let (result, events) = run(&flow, &base).await;
        assert!(!result.unwrap());
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_helper_functions_compose_requests() {
        let resolver = dns_fixture(HashMap::from([("app.test".to_string(), [10, 0, 0, 1])])).await;
        let base = http_fixture(|head| (200, request_path(head))).await;
        let options = flow_options("flow-function", "function f() { return dns() }; f() && http()");
        let flow = engine(
            &options,
            vec![
                dns_request(&options, resolver, A_MATCHER),
                http_request(&options, "path: ['{{BaseURL}}/ok']\nmatchers:\n  - type: word\n    words: ['/ok']\n"),
            ],
        );
        let (result, events) = run(&flow, &base).await;
        assert!(result.unwrap());
        assert!(events.iter().any(|e| e.field("body") == "/ok"));
    }

    #[test]
    fn test_compile_rejects_bad_scripts() {
        let options = flow_options("flow-compile", "dns()");
        let mut flow = FlowExecutor::new(Vec::new(), Arc::clone(&options), "dns()");
        assert!(matches!(flow.compile(), Err(TemplarError::Compile(_))));
        let mut flow = FlowExecutor::new(Vec::new(), options, "if (");
        assert!(matches!(flow.compile(), Err(TemplarError::Compile(_))));
    }
}
