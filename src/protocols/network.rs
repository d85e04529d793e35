//! Raw TCP backend.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::eventcreator::create_event_with_interactions;
use super::{local_names, payload_combinations, ExecutorOptions, ProtocolType, Request, ScanContext};
use crate::errors::TemplarError;
use crate::generators::{deserialize_payloads, AttackType, PayloadGenerator, PayloadSource};
use crate::operators::Operators;
use crate::output::{InternalEvent, InternalWrappedEvent};

const DEFAULT_READ_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    #[default]
    Text,
    Hex,
}

/// Data written to the connection, optionally followed by a read.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NetworkInput {
    pub data: String,
    #[serde(rename = "type")]
    pub kind: InputKind,
    /// Bytes to read after writing this input. 0 skips the read.
    pub read: usize,
    /// Event key the read bytes are stored under.
    pub name: Option<String>,
}

/// One `network:` (or `tcp:`) block.
#[derive(Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct NetworkRequest {
    pub id: Option<String>,
    /// Addresses to connect to. Defaults to `{{Hostname}}`.
    pub host: Vec<String>,
    pub inputs: Vec<NetworkInput>,
    pub read_size: usize,
    /// Read until the peer closes instead of a single read.
    pub read_all: bool,
    #[serde(deserialize_with = "deserialize_payloads")]
    pub payloads: Vec<(String, PayloadSource)>,
    pub attack: Option<AttackType>,
    #[serde(flatten)]
    pub operators: Operators,

    #[serde(skip)]
    generator: Option<PayloadGenerator>,
    #[serde(skip)]
    options: Option<Arc<ExecutorOptions>>,
}

/// Read once, or until EOF when `all` is set, stopping at `limit` bytes.
/// A read that times out ends the data rather than failing.
async fn read_from(stream: &mut TcpStream, limit: usize, all: bool, timeout: Duration) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = vec![0u8; limit.clamp(1, 64 * 1024)];
    while out.len() < limit {
        let want = (limit - out.len()).min(buf.len());
        match tokio::time::timeout(timeout, stream.read(&mut buf[..want])).await {
            Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
            Ok(Ok(n)) => out.extend_from_slice(&buf[..n]),
        }
        if !all {
            break;
        }
    }
    out
}

impl NetworkRequest {
    fn addresses(&self) -> Vec<&str> {
        if self.host.is_empty() {
            vec!["{{Hostname}}"]
        } else {
            self.host.iter().map(String::as_str).collect()
        }
    }

    fn read_size(&self, options: &ExecutorOptions) -> usize {
        let size = if self.read_size == 0 { DEFAULT_READ_SIZE } else { self.read_size };
        size.min(options.options.max_read_size.max(1))
    }

    async fn exchange(
        &self,
        options: &ExecutorOptions,
        scan: &ScanContext,
        values: &Map<String, Value>,
        address: &str,
    ) -> Result<(InternalEvent, Vec<String>), TemplarError> {
        let mut urls = Vec::new();
        let address = options.render(address, values, &mut urls)?;
        let mut payloads = Vec::with_capacity(self.inputs.len());
        for input in &self.inputs {
            let data = options.render(&input.data, values, &mut urls)?;
            let bytes = match input.kind {
                InputKind::Text => data.into_bytes(),
                InputKind::Hex => hex::decode(data.trim())
                    .map_err(|e| TemplarError::Protocol(format!("invalid hex input: {}", e)))?,
            };
            payloads.push((input, bytes));
        }

        let timeout = options.options.timeout;
        options.rate_limiter.take(&scan.cancel).await?;
        debug!(template_id = %options.template_id, address = %address, "Connecting");

        let mut stream = tokio::select! {
            _ = scan.cancel.cancelled() => return Err(TemplarError::Cancelled("network request aborted".into())),
            connected = tokio::time::timeout(timeout, TcpStream::connect(address.as_str())) => match connected {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => return Err(TemplarError::Network(format!("connect {}: {}", address, e))),
                Err(_) => return Err(TemplarError::Timeout(format!("connect {} timed out", address))),
            },
        };
        let ip = stream.peer_addr().ok().map(|addr| addr.ip().to_string());

        let mut event = InternalEvent::new();
        let mut sent = Vec::new();
        let mut received = Vec::new();
        for (input, bytes) in payloads {
            stream
                .write_all(&bytes)
                .await
                .map_err(|e| TemplarError::Network(format!("write {}: {}", address, e)))?;
            sent.extend_from_slice(&bytes);
            if input.read > 0 {
                let chunk = read_from(&mut stream, input.read, false, timeout).await;
                if let Some(name) = &input.name {
                    event.insert(name.clone(), Value::String(String::from_utf8_lossy(&chunk).into_owned()));
                }
                received.extend_from_slice(&chunk);
            }
        }
        let data = read_from(&mut stream, self.read_size(options), self.read_all, timeout).await;
        received.extend_from_slice(&data);

        let raw = String::from_utf8_lossy(&received).into_owned();
        event.insert("host".into(), Value::String(scan.input.input.clone()));
        event.insert("matched".into(), Value::String(address));
        event.insert("request".into(), Value::String(String::from_utf8_lossy(&sent).into_owned()));
        event.insert("data".into(), Value::String(String::from_utf8_lossy(&data).into_owned()));
        event.insert("raw".into(), Value::String(raw.clone()));
        event.insert("response".into(), Value::String(raw));
        if let Some(ip) = ip {
            event.insert("ip".into(), Value::String(ip));
        }
        Ok((event, urls))
    }
}

#[async_trait]
impl Request for NetworkRequest {
    fn compile(&mut self, options: Arc<ExecutorOptions>) -> Result<(), TemplarError> {
        for input in &self.inputs {
            if input.kind == InputKind::Hex && !input.data.contains("{{") {
                hex::decode(input.data.trim())
                    .map_err(|e| TemplarError::Compile(format!("invalid hex input '{}': {}", input.data, e)))?;
            }
        }
        self.operators.compile()?;
        self.generator = options.payload_generator(&self.payloads, self.attack)?;

        let mut texts = self.addresses();
        texts.extend(self.inputs.iter().map(|input| input.data.as_str()));
        options.check_variables(&texts, &local_names(&self.payloads, &self.operators))?;
        self.options = Some(options);
        Ok(())
    }

    fn requests(&self) -> usize {
        self.addresses().len() * self.generator.as_ref().map(|g| g.total()).unwrap_or(1)
    }

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn protocol(&self) -> ProtocolType {
        ProtocolType::Network
    }

    fn operators(&self) -> &Operators {
        &self.operators
    }

    fn default_part(&self) -> &'static str {
        "data"
    }

    async fn execute_with_results(
        &self,
        scan: &ScanContext,
        dynamic_values: &Map<String, Value>,
        previous: &InternalEvent,
        callback: &mut (dyn FnMut(InternalWrappedEvent) + Send),
    ) -> Result<(), TemplarError> {
        let options = self
            .options
            .as_ref()
            .ok_or_else(|| TemplarError::Internal("network request used before compile".into()))?;
        let mut last_error = None;
        let mut index = 0;

        'payloads: for payload in payload_combinations(self.generator.as_ref()) {
            for address in self.addresses() {
                index += 1;
                if scan.cancel.is_cancelled() {
                    return Err(TemplarError::Cancelled("scan cancelled".into()));
                }
                options.check_host(&scan.input)?;

                let mut values = options.build_values(scan, dynamic_values, previous);
                values.extend(payload.clone());
                match self.exchange(options, scan, &values, address).await {
                    Ok((event, urls)) => {
                        let wrapped = create_event_with_interactions(self, options, event, &payload, &urls);
                        options.add_template_vars(&scan.ctx, ProtocolType::Network, self.id(), &wrapped.internal_event);
                        let found = wrapped.has_results();
                        callback(wrapped);
                        if found && options.stop_at_first_match {
                            break 'payloads;
                        }
                    }
                    Err(TemplarError::Cancelled(reason)) => return Err(TemplarError::Cancelled(reason)),
                    Err(e) => {
                        options.record_request_error(&scan.input, ProtocolType::Network, index, &e);
                        last_error = Some(e);
                    }
                }
            }
        }
        last_error.map_or(Ok(()), Err)
    }
}
