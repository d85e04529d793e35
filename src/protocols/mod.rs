//! Protocol backends and the state they share.
//!
//! Every backend implements [`Request`]. Matching and extraction default to
//! the shared dispatch in [`crate::operators`]; result synthesis defaults to
//! [`eventcreator`]. Per-template state lives in [`ExecutorOptions`].

pub mod contextargs;
pub mod dns;
pub mod eventcreator;
pub mod hosterrors;
pub mod http;
pub mod network;
pub mod ratelimit;
pub mod replacer;
pub mod types;

pub use contextargs::{Context, MetaInput, ScanContext};
pub use hosterrors::HostErrorsCache;
pub use ratelimit::RateLimiter;
pub use types::ProtocolType;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

use crate::catalog::Catalog;
use crate::config::EngineOptions;
use crate::dsl::Expression;
use crate::errors::TemplarError;
use crate::generators::{AttackType, PayloadGenerator, PayloadSource};
use crate::interactsh::{self, InteractshClient};
use crate::models::TemplateInfo;
use crate::operators::{self, Extractor, Matcher, Operators};
use crate::output::{InternalEvent, InternalWrappedEvent, ResultEvent};

/// Keys describing the template itself. They travel with every event but are
/// never copied into the shared context.
pub const TEMPLATE_ID_KEY: &str = "template-id";
pub const TEMPLATE_PATH_KEY: &str = "template-path";
pub const TEMPLATE_INFO_KEY: &str = "template-info";

/// A protocol backend.
#[async_trait]
pub trait Request: Send + Sync {
    /// Resolve payloads and compile operators. Errors abort loading of the
    /// owning template only.
    fn compile(&mut self, options: Arc<ExecutorOptions>) -> Result<(), TemplarError>;

    /// Number of concrete requests issued per target.
    fn requests(&self) -> usize;

    /// Explicit identifier other requests and flow scripts can address.
    fn id(&self) -> Option<&str>;

    fn protocol(&self) -> ProtocolType;

    fn operators(&self) -> &Operators;

    /// Response part matched when a matcher or extractor names none.
    fn default_part(&self) -> &'static str;

    fn match_part(&self, data: &InternalEvent, matcher: &Matcher) -> (bool, Vec<String>) {
        operators::default_match(data, matcher, self.default_part())
    }

    fn extract(&self, data: &InternalEvent, extractor: &Extractor) -> Vec<String> {
        operators::default_extract(data, extractor, self.default_part())
    }

    /// Issue the request(s) against `scan.input`, calling `callback` once per
    /// response event. Per-request failures are logged and recorded in the
    /// host error cache; the last one is returned.
    async fn execute_with_results(
        &self,
        scan: &ScanContext,
        dynamic_values: &Map<String, Value>,
        previous: &InternalEvent,
        callback: &mut (dyn FnMut(InternalWrappedEvent) + Send),
    ) -> Result<(), TemplarError>;

    fn make_result_event_item(&self, wrapped: &InternalWrappedEvent) -> ResultEvent {
        eventcreator::default_result_item(wrapped, self.protocol())
    }

    fn make_result_event(&self, wrapped: &InternalWrappedEvent) -> Vec<ResultEvent> {
        eventcreator::make_default_result_event(wrapped, |w| self.make_result_event_item(w))
    }
}

/// Shared, process-wide services every template is compiled against.
#[derive(Clone)]
pub struct ProtocolResources {
    pub options: Arc<EngineOptions>,
    pub catalog: Arc<dyn Catalog>,
    pub rate_limiter: Arc<RateLimiter>,
    pub host_errors: Option<Arc<HostErrorsCache>>,
    pub interactsh: Option<Arc<InteractshClient>>,
}

impl ProtocolResources {
    /// Build the rate limiter and host error cache from `options`.
    pub fn new(options: Arc<EngineOptions>, catalog: Arc<dyn Catalog>) -> Self {
        let rate_limiter = Arc::new(RateLimiter::new(options.rate_limit, options.rate_limit_window));
        let host_errors = (options.max_host_error > 0)
            .then(|| Arc::new(HostErrorsCache::new(options.max_host_error, options.track_errors.clone())));
        Self { options, catalog, rate_limiter, host_errors, interactsh: None }
    }

    pub fn with_interactsh(mut self, client: Arc<InteractshClient>) -> Self {
        self.interactsh = Some(client);
        self
    }
}

/// Per-template configuration bound at compile time, plus the store of
/// per-scan contexts keyed by `hash(target, template id)`.
pub struct ExecutorOptions {
    pub template_id: String,
    pub template_path: Option<PathBuf>,
    pub template_info: TemplateInfo,
    pub options: Arc<EngineOptions>,
    pub catalog: Arc<dyn Catalog>,
    pub rate_limiter: Arc<RateLimiter>,
    pub host_errors: Option<Arc<HostErrorsCache>>,
    pub interactsh: Option<Arc<InteractshClient>>,
    /// Template-level variables in declaration order.
    pub variables: Vec<(String, String)>,
    pub is_multi_protocol: bool,
    pub flow: Option<String>,
    pub stop_at_first_match: bool,
    template_ctx_store: DashMap<String, Context>,
}

impl ExecutorOptions {
    pub fn new(template_id: impl Into<String>, info: TemplateInfo, resources: &ProtocolResources) -> Self {
        Self {
            template_id: template_id.into(),
            template_path: None,
            template_info: info,
            options: Arc::clone(&resources.options),
            catalog: Arc::clone(&resources.catalog),
            rate_limiter: Arc::clone(&resources.rate_limiter),
            host_errors: resources.host_errors.clone(),
            interactsh: resources.interactsh.clone(),
            variables: Vec::new(),
            is_multi_protocol: false,
            flow: None,
            stop_at_first_match: resources.options.stop_at_first_match,
            template_ctx_store: DashMap::new(),
        }
    }

    pub fn scan_id(&self, input: &MetaInput) -> String {
        let mut hasher = DefaultHasher::new();
        input.input.hash(&mut hasher);
        self.template_id.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }

    /// The context of this scan unit, created on first use.
    pub fn get_template_ctx(&self, input: &MetaInput) -> Context {
        self.template_ctx_store.entry(self.scan_id(input)).or_default().clone()
    }

    pub fn has_template_ctx(&self, input: &MetaInput) -> bool {
        self.template_ctx_store.contains_key(&self.scan_id(input))
    }

    pub fn remove_template_ctx(&self, input: &MetaInput) {
        self.template_ctx_store.remove(&self.scan_id(input));
    }

    pub fn active_contexts(&self) -> usize {
        self.template_ctx_store.len()
    }

    fn shares_context(&self) -> bool {
        self.is_multi_protocol || self.flow.is_some()
    }

    /// Copy `vars` into `ctx` under `<request id>_` or `<protocol>_`.
    /// Only multi-protocol and flow templates share a context.
    pub fn add_template_vars(
        &self,
        ctx: &Context,
        protocol: ProtocolType,
        request_id: Option<&str>,
        vars: &Map<String, Value>,
    ) {
        if !self.shares_context() {
            return;
        }
        let prefix = request_id.filter(|id| !id.is_empty()).unwrap_or(protocol.as_str());
        for (key, value) in vars {
            if matches!(key.as_str(), TEMPLATE_ID_KEY | TEMPLATE_PATH_KEY | TEMPLATE_INFO_KEY) {
                continue;
            }
            ctx.set(format!("{}_{}", prefix, key), value.clone());
        }
    }

    /// Template metadata inserted into every event.
    pub fn template_fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert(TEMPLATE_ID_KEY.into(), Value::String(self.template_id.clone()));
        if let Some(path) = &self.template_path {
            fields.insert(TEMPLATE_PATH_KEY.into(), Value::String(path.display().to_string()));
        }
        if let Ok(info) = serde_json::to_value(&self.template_info) {
            fields.insert(TEMPLATE_INFO_KEY.into(), info);
        }
        fields
    }

    /// Fail with `HostSkipped` once the target's host went over the error threshold.
    pub fn check_host(&self, input: &MetaInput) -> Result<(), TemplarError> {
        match &self.host_errors {
            Some(cache) if cache.check(input) => Err(TemplarError::HostSkipped(input.host_key())),
            _ => Ok(()),
        }
    }

    pub fn mark_host_error(&self, input: &MetaInput, error: &TemplarError) {
        if let Some(cache) = &self.host_errors {
            cache.mark_failed(input, error);
        }
    }

    /// Log a per-request failure and count it against the host.
    pub fn record_request_error(&self, input: &MetaInput, protocol: ProtocolType, index: usize, error: &TemplarError) {
        warn!(
            template_id = %self.template_id,
            target = %input,
            protocol = %protocol,
            request_index = index,
            error = %error,
            "Request failed"
        );
        self.mark_host_error(input, error);
    }

    /// Variables visible to a request: target variables, template
    /// variables, the shared context, then dynamic values, later sources
    /// winning. Fields of the previous event only fill missing keys.
    pub fn build_values(
        &self,
        scan: &ScanContext,
        dynamic_values: &Map<String, Value>,
        previous: &InternalEvent,
    ) -> Map<String, Value> {
        let mut values = scan.input.variables();
        let context = scan.ctx.all();
        let mut scope = values.clone();
        scope.extend(context.clone());
        scope.extend(dynamic_values.clone());
        values.extend(replacer::evaluate_variables(&self.variables, &scope));
        values.extend(context);
        values.extend(dynamic_values.clone());
        for (key, value) in previous {
            values.entry(key.clone()).or_insert_with(|| value.clone());
        }
        values
    }

    /// Substitute every marker of `template`. Interaction markers get fresh
    /// URLs, collected into `urls`; without an interaction client they stay
    /// unresolved and the request fails.
    pub fn render(
        &self,
        template: &str,
        values: &Map<String, Value>,
        urls: &mut Vec<String>,
    ) -> Result<String, TemplarError> {
        let text = match &self.interactsh {
            Some(client) if interactsh::has_markers(template) => client.replace_markers(template, urls),
            _ => template.to_string(),
        };
        replacer::replace_strict(&text, values)
    }

    /// Reject markers that cannot resolve. Plain variable markers must name a
    /// target variable, a template variable or one of `known`; templates that
    /// share a context accept any name since earlier requests may define it.
    pub fn check_variables(&self, texts: &[&str], known: &[String]) -> Result<(), TemplarError> {
        for text in texts {
            for marker in replacer::unresolved(text) {
                if marker == "interactsh-url" {
                    continue;
                }
                let plain = marker.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
                if !plain {
                    Expression::compile(&marker)
                        .map_err(|e| TemplarError::Compile(format!("invalid expression '{{{{{}}}}}': {}", marker, e)))?;
                    continue;
                }
                let defined = contextargs::TARGET_VARIABLES.contains(&marker.as_str())
                    || self.variables.iter().any(|(name, _)| *name == marker)
                    || known.contains(&marker);
                if !defined && !self.shares_context() {
                    return Err(TemplarError::Compile(format!(
                        "template {} references undefined variable '{}'",
                        self.template_id, marker
                    )));
                }
            }
        }
        Ok(())
    }

    /// Build a payload generator for a request block, or `None` without payloads.
    pub fn payload_generator(
        &self,
        payloads: &[(String, PayloadSource)],
        attack: Option<AttackType>,
    ) -> Result<Option<PayloadGenerator>, TemplarError> {
        if payloads.is_empty() {
            return Ok(None);
        }
        let attack = attack.unwrap_or_else(|| AttackType::default_for(payloads.len()));
        PayloadGenerator::new(payloads, attack, self.template_path.as_deref(), self.catalog.as_ref()).map(Some)
    }
}

/// Names a request block defines for its own markers: payload names and
/// internal extractor names.
pub(crate) fn local_names(payloads: &[(String, PayloadSource)], operators: &Operators) -> Vec<String> {
    payloads
        .iter()
        .map(|(name, _)| name.clone())
        .chain(operators.extractors.iter().filter(|e| e.internal).filter_map(|e| e.name.clone()))
        .collect()
}

/// Payload combinations of `generator` produced one at a time, or a single
/// empty one when there is no generator.
pub(crate) fn payload_combinations(
    generator: Option<&PayloadGenerator>,
) -> impl Iterator<Item = Map<String, Value>> + Send + '_ {
    let single = generator.is_none().then(Map::new);
    generator.into_iter().flat_map(|g| g.iterator()).chain(single)
}

#[cfg(test)]
pub(crate) mod testutil;

#[cfg(test)]
mod tests {
    use super::testutil::executor_options;
    use super::*;
    use serde_json::json;

    #[test]
    fn test_one_context_per_scan_unit() {
        let options = executor_options("t1");
        let a = MetaInput::new("http://a.test");
        let b = MetaInput::new("http://b.test");

        let ctx = options.get_template_ctx(&a);
        ctx.set("k", json!("v"));
        assert!(options.get_template_ctx(&a).same_as(&ctx));
        assert!(!options.get_template_ctx(&b).same_as(&ctx));
        assert_eq!(options.active_contexts(), 2);

        options.remove_template_ctx(&a);
        assert!(!options.has_template_ctx(&a));
        assert!(options.get_template_ctx(&a).get("k").is_none());
    }

    #[test]
    fn test_scan_id_depends_on_template() {
        let input = MetaInput::new("a.test");
        assert_ne!(executor_options("t1").scan_id(&input), executor_options("t2").scan_id(&input));
        assert_eq!(executor_options("t1").scan_id(&input), executor_options("t1").scan_id(&input));
    }

    #[test]
    fn test_add_template_vars_prefixing() {
        let vars = json!({"status_code": 200, "template-id": "t1"}).as_object().cloned().unwrap();

        let generic = executor_options("t1");
        let ctx = Context::new();
        generic.add_template_vars(&ctx, ProtocolType::Http, None, &vars);
        assert!(ctx.is_empty());

        let mut multi = executor_options("t1");
        multi.is_multi_protocol = true;
        multi.add_template_vars(&ctx, ProtocolType::Http, None, &vars);
        multi.add_template_vars(&ctx, ProtocolType::Http, Some("login"), &vars);
        assert_eq!(ctx.get("http_status_code"), Some(json!(200)));
        assert_eq!(ctx.get("login_status_code"), Some(json!(200)));
        assert!(!ctx.has("http_template-id"));
    }

    #[test]
    fn test_build_values_precedence() {
        let mut options = executor_options("t1");
        options.variables = vec![("greeting".into(), "hi-{{Host}}".into())];
        let scan = ScanContext::detached("http://a.test");
        scan.ctx.set("token", json!("from-ctx"));
        let dynamic = json!({"token": "from-dynamic"}).as_object().cloned().unwrap();
        let previous = json!({"Host": "ignored", "body": "prev"}).as_object().cloned().unwrap();

        let values = options.build_values(&scan, &dynamic, &previous);
        assert_eq!(values["greeting"], json!("hi-a.test"));
        assert_eq!(values["token"], json!("from-dynamic"));
        assert_eq!(values["Host"], json!("a.test"));
        assert_eq!(values["body"], json!("prev"));
    }

    #[test]
    fn test_check_variables() {
        let mut options = executor_options("t1");
        options.variables = vec![("user".into(), "admin".into())];
        let known = vec!["token".to_string()];
        assert!(options.check_variables(&["{{BaseURL}}/{{user}}?t={{token}}&{{interactsh-url}}"], &known).is_ok());
        assert!(options.check_variables(&["{{to_upper(user)}}"], &known).is_ok());
        assert!(matches!(options.check_variables(&["{{missing}}"], &known), Err(TemplarError::Compile(_))));
        assert!(options.check_variables(&["{{len(}}"], &known).is_err());

        options.is_multi_protocol = true;
        assert!(options.check_variables(&["{{dns_a}}"], &known).is_ok());
    }

    #[test]
    fn test_template_fields() {
        let fields = executor_options("t1").template_fields();
        assert_eq!(fields[TEMPLATE_ID_KEY], json!("t1"));
        assert_eq!(fields[TEMPLATE_INFO_KEY]["severity"], json!("info"));
    }
}
