//! HTTP backend.

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::redirect::Policy;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use super::eventcreator::create_event_with_interactions;
use super::{local_names, payload_combinations, ExecutorOptions, ProtocolType, Request, ScanContext};
use crate::errors::TemplarError;
use crate::generators::{deserialize_payloads, AttackType, PayloadGenerator, PayloadSource};
use crate::operators::Operators;
use crate::output::{InternalEvent, InternalWrappedEvent};

const DEFAULT_MAX_REDIRECTS: usize = 10;

/// One `http:` block. Each path is issued once per payload combination;
/// internal extractor values of a response are available to the next path.
#[derive(Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct HttpRequest {
    pub id: Option<String>,
    pub method: String,
    pub path: Vec<String>,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    #[serde(deserialize_with = "deserialize_payloads")]
    pub payloads: Vec<(String, PayloadSource)>,
    pub attack: Option<AttackType>,
    /// Follow redirects for this block even when the engine does not.
    pub redirects: bool,
    pub max_redirects: Option<usize>,
    /// Stop issuing this block's requests after the first result.
    pub stop_at_first_match: bool,
    #[serde(flatten)]
    pub operators: Operators,

    #[serde(skip)]
    generator: Option<PayloadGenerator>,
    #[serde(skip)]
    client: Option<reqwest::Client>,
    #[serde(skip)]
    options: Option<Arc<ExecutorOptions>>,
}

impl HttpRequest {
    fn method(&self) -> &str {
        if self.method.is_empty() {
            "GET"
        } else {
            &self.method
        }
    }

    fn compiled(&self) -> Result<(&Arc<ExecutorOptions>, &reqwest::Client), TemplarError> {
        match (&self.options, &self.client) {
            (Some(options), Some(client)) => Ok((options, client)),
            _ => Err(TemplarError::Internal("http request used before compile".into())),
        }
    }

    async fn send(
        &self,
        options: &ExecutorOptions,
        client: &reqwest::Client,
        scan: &ScanContext,
        values: &Map<String, Value>,
        path: &str,
    ) -> Result<(InternalEvent, Vec<String>), TemplarError> {
        let mut urls = Vec::new();
        let url = options.render(path, values, &mut urls)?;
        let body = options.render(&self.body, values, &mut urls)?;
        let mut headers = Vec::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            headers.push((name.clone(), options.render(value, values, &mut urls)?));
        }
        let method = reqwest::Method::from_bytes(self.method().to_ascii_uppercase().as_bytes())
            .map_err(|e| TemplarError::Protocol(format!("invalid method '{}': {}", self.method(), e)))?;

        options.rate_limiter.take(&scan.cancel).await?;

        let mut builder = client.request(method.clone(), url.as_str());
        for (name, value) in &headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !body.is_empty() {
            builder = builder.body(body.clone());
        }
        let raw_request = dump_request(method.as_str(), &url, &headers, &body);
        debug!(template_id = %options.template_id, url = %url, "Sending HTTP request");

        let response = tokio::select! {
            _ = scan.cancel.cancelled() => return Err(TemplarError::Cancelled("http request aborted".into())),
            response = builder.send() => response?,
        };
        let status = response.status();
        let version = format!("{:?}", response.version());
        let response_headers = response.headers().clone();
        let ip = response.remote_addr().map(|addr| addr.ip().to_string());
        let response_body = response.text().await?;

        let mut event = InternalEvent::new();
        event.insert("host".into(), Value::String(scan.input.input.clone()));
        event.insert("matched".into(), Value::String(url));
        event.insert("request".into(), Value::String(raw_request));
        let header_text = dump_headers(&response_headers);
        event.insert(
            "response".into(),
            Value::String(format!("{} {}\r\n{}\r\n{}", version, status, header_text, response_body)),
        );
        event.insert("status_code".into(), Value::from(status.as_u16()));
        event.insert("content_length".into(), Value::from(response_body.len()));
        event.insert("header".into(), Value::String(header_text));
        for (name, value) in &response_headers {
            let key = name.as_str().to_ascii_lowercase().replace('-', "_");
            event.insert(key, Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned()));
        }
        event.insert("body".into(), Value::String(response_body));
        if let Some(ip) = ip {
            event.insert("ip".into(), Value::String(ip));
        }
        Ok((event, urls))
    }
}

fn dump_request(method: &str, url: &str, headers: &[(String, String)], body: &str) -> String {
    let (host, path) = match url::Url::parse(url) {
        Ok(parsed) => {
            let host = match parsed.port() {
                Some(port) => format!("{}:{}", parsed.host_str().unwrap_or_default(), port),
                None => parsed.host_str().unwrap_or_default().to_string(),
            };
            let path = match parsed.query() {
                Some(query) => format!("{}?{}", parsed.path(), query),
                None => parsed.path().to_string(),
            };
            (host, path)
        }
        Err(_) => (String::new(), url.to_string()),
    };
    let mut out = format!("{} {} HTTP/1.1\r\nHost: {}\r\n", method, path, host);
    for (name, value) in headers {
        out.push_str(&format!("{}: {}\r\n", name, value));
    }
    out.push_str("\r\n");
    out.push_str(body);
    out
}

fn dump_headers(headers: &HeaderMap) -> String {
    headers
        .iter()
        .map(|(name, value)| format!("{}: {}\r\n", name, String::from_utf8_lossy(value.as_bytes())))
        .collect()
}

#[async_trait]
impl Request for HttpRequest {
    fn compile(&mut self, options: Arc<ExecutorOptions>) -> Result<(), TemplarError> {
        if self.path.is_empty() {
            return Err(TemplarError::Compile(format!("{}: http block has no path", options.template_id)));
        }
        self.operators.compile()?;
        self.generator = options.payload_generator(&self.payloads, self.attack)?;

        let mut texts: Vec<&str> = self.path.iter().map(String::as_str).collect();
        texts.push(&self.body);
        texts.extend(self.headers.values().map(String::as_str));
        options.check_variables(&texts, &local_names(&self.payloads, &self.operators))?;

        let policy = if self.redirects || options.options.follow_redirects {
            Policy::limited(self.max_redirects.unwrap_or(DEFAULT_MAX_REDIRECTS))
        } else {
            Policy::none()
        };
        let client = reqwest::Client::builder()
            .timeout(options.options.timeout)
            .redirect(policy)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| TemplarError::Compile(format!("Failed to build HTTP client: {}", e)))?;
        self.client = Some(client);
        self.options = Some(options);
        Ok(())
    }

    fn requests(&self) -> usize {
        let combinations = self.generator.as_ref().map(|g| g.total()).unwrap_or(1);
        self.path.len() * combinations
    }

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn protocol(&self) -> ProtocolType {
        ProtocolType::Http
    }

    fn operators(&self) -> &Operators {
        &self.operators
    }

    fn default_part(&self) -> &'static str {
        "body"
    }

    async fn execute_with_results(
        &self,
        scan: &ScanContext,
        dynamic_values: &Map<String, Value>,
        previous: &InternalEvent,
        callback: &mut (dyn FnMut(InternalWrappedEvent) + Send),
    ) -> Result<(), TemplarError> {
        let (options, client) = self.compiled()?;
        let mut chained = Map::new();
        let mut last_error = None;
        let mut index = 0;
        let stop_at_first_match = self.stop_at_first_match || options.stop_at_first_match;

        'payloads: for payload in payload_combinations(self.generator.as_ref()) {
            for path in &self.path {
                index += 1;
                if scan.cancel.is_cancelled() {
                    return Err(TemplarError::Cancelled("scan cancelled".into()));
                }
                options.check_host(&scan.input)?;

                let mut values = options.build_values(scan, dynamic_values, previous);
                values.extend(chained.clone());
                values.extend(payload.clone());

                match self.send(options, client, scan, &values, path).await {
                    Ok((event, urls)) => {
                        let wrapped = create_event_with_interactions(self, options, event, &payload, &urls);
                        if let Some(result) = &wrapped.operators_result {
                            chained.extend(result.dynamic_map());
                        }
                        options.add_template_vars(&scan.ctx, ProtocolType::Http, self.id(), &wrapped.internal_event);
                        let found = wrapped.has_results();
                        callback(wrapped);
                        if found && stop_at_first_match {
                            break 'payloads;
                        }
                    }
                    Err(TemplarError::Cancelled(reason)) => return Err(TemplarError::Cancelled(reason)),
                    Err(e) => {
                        options.record_request_error(&scan.input, ProtocolType::Http, index, &e);
                        last_error = Some(e);
                    }
                }
            }
        }
        last_error.map_or(Ok(()), Err)
    }
}
