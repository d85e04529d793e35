//! DNS backend.

use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfig, ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::rr::RecordType;
use hickory_resolver::proto::xfer::Protocol;
use hickory_resolver::{Resolver, TokioResolver};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;

use super::eventcreator::create_event_with_payload;
use super::{local_names, payload_combinations, ExecutorOptions, ProtocolType, Request, ScanContext};
use crate::errors::TemplarError;
use crate::generators::{deserialize_payloads, AttackType, PayloadGenerator, PayloadSource};
use crate::operators::Operators;
use crate::output::{InternalEvent, InternalWrappedEvent};

/// One `dns:` block: a single question per payload combination.
#[derive(Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DnsRequest {
    pub id: Option<String>,
    /// Name to resolve. Defaults to `{{FQDN}}`.
    pub name: String,
    /// Record type, e.g. `A`, `CNAME`, `TXT`.
    #[serde(rename = "type")]
    pub record_type: String,
    /// Name servers as `ip` or `ip:port`. Empty uses the system defaults.
    pub resolvers: Vec<String>,
    pub retries: usize,
    #[serde(deserialize_with = "deserialize_payloads")]
    pub payloads: Vec<(String, PayloadSource)>,
    pub attack: Option<AttackType>,
    #[serde(flatten)]
    pub operators: Operators,

    #[serde(skip)]
    question_type: Option<RecordType>,
    #[serde(skip)]
    generator: Option<PayloadGenerator>,
    #[serde(skip)]
    resolver: OnceCell<TokioResolver>,
    #[serde(skip)]
    options: Option<Arc<ExecutorOptions>>,
}

fn parse_resolver(address: &str) -> Result<SocketAddr, TemplarError> {
    SocketAddr::from_str(address)
        .or_else(|_| SocketAddr::from_str(&format!("{}:53", address)))
        .map_err(|_| TemplarError::Compile(format!("invalid dns resolver '{}'", address)))
}

impl DnsRequest {
    fn name_template(&self) -> &str {
        if self.name.is_empty() {
            "{{FQDN}}"
        } else {
            &self.name
        }
    }

    fn build_resolver(&self, options: &ExecutorOptions) -> Result<TokioResolver, TemplarError> {
        let config = if self.resolvers.is_empty() {
            ResolverConfig::default()
        } else {
            let mut config = ResolverConfig::new();
            for address in &self.resolvers {
                config.add_name_server(NameServerConfig::new(parse_resolver(address)?, Protocol::Udp));
            }
            config
        };
        let mut opts = ResolverOpts::default();
        opts.timeout = options.options.timeout;
        opts.attempts = self.retries.max(1);
        Ok(Resolver::builder_with_config(config, TokioConnectionProvider::default())
            .with_options(opts)
            .build())
    }

    async fn resolve(
        &self,
        options: &ExecutorOptions,
        scan: &ScanContext,
        values: &Map<String, Value>,
    ) -> Result<InternalEvent, TemplarError> {
        let mut urls = Vec::new();
        let name = options.render(self.name_template(), values, &mut urls)?;
        let fqdn = if name.ends_with('.') { name.clone() } else { format!("{}.", name) };
        let question_type = self.question_type.unwrap_or(RecordType::A);
        let resolver = self.resolver.get_or_try_init(|| async { self.build_resolver(options) }).await?;

        options.rate_limiter.take(&scan.cancel).await?;
        debug!(template_id = %options.template_id, name = %fqdn, record_type = %question_type, "Sending DNS query");

        let lookup = tokio::select! {
            _ = scan.cancel.cancelled() => return Err(TemplarError::Cancelled("dns query aborted".into())),
            lookup = resolver.lookup(fqdn.as_str(), question_type) => lookup,
        };
        let (rcode, records) = match lookup {
            Ok(lookup) => {
                let records: Vec<(RecordType, String)> =
                    lookup.iter().map(|rdata| (rdata.record_type(), rdata.to_string())).collect();
                ("NOERROR", records)
            }
            Err(e) if e.is_nx_domain() => ("NXDOMAIN", Vec::new()),
            Err(e) if e.is_no_records_found() => ("NOERROR", Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let question = format!(";; QUESTION SECTION:\n;{}\tIN\t{}\n", fqdn, question_type);
        let answer: Vec<String> = records
            .iter()
            .map(|(kind, data)| format!("{}\tIN\t{}\t{}", fqdn, kind, data))
            .collect();
        let raw = format!(
            ";; ->>HEADER<<- status: {}\n{}\n;; ANSWER SECTION:\n{}",
            rcode,
            question,
            answer.join("\n")
        );

        let mut event = InternalEvent::new();
        event.insert("host".into(), Value::String(scan.input.input.clone()));
        event.insert("matched".into(), Value::String(name));
        event.insert("request".into(), Value::String(question));
        event.insert("rcode".into(), Value::String(rcode.to_string()));
        event.insert("answer".into(), Value::String(answer.join("\n")));
        event.insert("raw".into(), Value::String(raw.clone()));
        event.insert("response".into(), Value::String(raw));
        for (kind, data) in records {
            let key = kind.to_string().to_ascii_lowercase();
            if let Value::Array(items) = event.entry(key).or_insert_with(|| Value::Array(Vec::new())) {
                items.push(Value::String(data.trim_end_matches('.').to_string()));
            }
        }
        Ok(event)
    }
}

#[async_trait]
impl Request for DnsRequest {
    fn compile(&mut self, options: Arc<ExecutorOptions>) -> Result<(), TemplarError> {
        let record_type = if self.record_type.is_empty() { "A" } else { self.record_type.as_str() };
        self.question_type = Some(
            RecordType::from_str(&record_type.to_ascii_uppercase())
                .map_err(|_| TemplarError::Compile(format!("unknown dns record type '{}'", record_type)))?,
        );
        for address in &self.resolvers {
            parse_resolver(address)?;
        }
        self.operators.compile()?;
        self.generator = options.payload_generator(&self.payloads, self.attack)?;
        options.check_variables(&[self.name_template()], &local_names(&self.payloads, &self.operators))?;
        self.options = Some(options);
        Ok(())
    }

    fn requests(&self) -> usize {
        self.generator.as_ref().map(|g| g.total()).unwrap_or(1)
    }

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn protocol(&self) -> ProtocolType {
        ProtocolType::Dns
    }

    fn operators(&self) -> &Operators {
        &self.operators
    }

    fn default_part(&self) -> &'static str {
        "raw"
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
            .ok_or_else(|| TemplarError::Internal("dns request used before compile".into()))?;
        let mut last_error = None;

        for (index, payload) in payload_combinations(self.generator.as_ref()).enumerate() {
            if scan.cancel.is_cancelled() {
                return Err(TemplarError::Cancelled("scan cancelled".into()));
            }
            options.check_host(&scan.input)?;

            let mut values = options.build_values(scan, dynamic_values, previous);
            values.extend(payload.clone());
            match self.resolve(options, scan, &values).await {
                Ok(event) => {
                    let wrapped = create_event_with_payload(self, options, event, &payload);
                    options.add_template_vars(&scan.ctx, ProtocolType::Dns, self.id(), &wrapped.internal_event);
                    let found = wrapped.has_results();
                    callback(wrapped);
                    if found && options.stop_at_first_match {
                        break;
                    }
                }
                Err(TemplarError::Cancelled(reason)) => return Err(TemplarError::Cancelled(reason)),
                Err(e) => {
                    options.record_request_error(&scan.input, ProtocolType::Dns, index + 1, &e);
                    last_error = Some(e);
                }
            }
        }
        last_error.map_or(Ok(()), Err)
    }
}
