//! Template documents.
//!
//! A template is a YAML mapping with an `id`, an `info` block, optional
//! `variables` and `flow`, and one or more protocol sections (`http`, `dns`,
//! `network`/`tcp`). Protocol sections keep their declared order, which is
//! the order requests run in for generic and multi-protocol templates.

mod loader;

pub use loader::{load_templates, LoadReport};

use serde::de::DeserializeOwned;
use serde_yaml::{Mapping, Value as YamlValue};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::errors::TemplarError;
use crate::models::TemplateInfo;
use crate::protocols::dns::DnsRequest;
use crate::protocols::http::HttpRequest;
use crate::protocols::network::NetworkRequest;
use crate::protocols::{ExecutorOptions, ProtocolResources, ProtocolType, Request};
use crate::tmplexec::{FlowExecutor, Generic, MultiProtocol, RequestQueue, TemplateEngine, TemplateExecuter};

const MAX_TEMPLATE_SIZE: usize = 1024 * 1024;

/// A template compiled against a set of protocol resources.
pub struct Template {
    pub id: String,
    pub info: TemplateInfo,
    pub path: Option<PathBuf>,
    /// Protocols in the order their sections appear.
    pub protocols: Vec<ProtocolType>,
    pub flow: Option<String>,
    pub executer: TemplateExecuter,
}

impl std::fmt::Debug for Template {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Template")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("protocols", &self.protocols)
            .field("engine", &self.executer.engine_name())
            .finish()
    }
}

/// Parsed but not yet compiled template document.
struct Document {
    id: String,
    info: TemplateInfo,
    variables: Vec<(String, String)>,
    flow: Option<String>,
    stop_at_first_match: bool,
    blocks: Vec<(ProtocolType, Box<dyn Request>)>,
}

fn block<T>(value: YamlValue) -> Result<Box<dyn Request>, TemplarError>
where
    T: Request + DeserializeOwned + 'static,
{
    Ok(Box::new(serde_yaml::from_value::<T>(value)?))
}

fn scalar_text(value: &YamlValue) -> Option<String> {
    match value {
        YamlValue::String(s) => Some(s.clone()),
        YamlValue::Number(n) => Some(n.to_string()),
        YamlValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn valid_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

fn parse_document(content: &str) -> Result<Document, TemplarError> {
    if content.len() > MAX_TEMPLATE_SIZE {
        return Err(TemplarError::Template(format!(
            "template exceeds maximum size ({} bytes, max {})",
            content.len(),
            MAX_TEMPLATE_SIZE
        )));
    }
    let root: Mapping = serde_yaml::from_str(content)?;

    let mut document = Document {
        id: String::new(),
        info: TemplateInfo::default(),
        variables: Vec::new(),
        flow: None,
        stop_at_first_match: false,
        blocks: Vec::new(),
    };
    for (key, value) in root {
        let Some(key) = key.as_str().map(str::to_string) else {
            return Err(TemplarError::Template("template keys must be strings".into()));
        };
        match key.as_str() {
            "id" => document.id = scalar_text(&value).unwrap_or_default(),
            "info" => document.info = serde_yaml::from_value(value)?,
            "flow" => document.flow = scalar_text(&value).filter(|f| !f.trim().is_empty()),
            "stop-at-first-match" => document.stop_at_first_match = value.as_bool().unwrap_or(false),
            "variables" => {
                let YamlValue::Mapping(vars) = value else {
                    return Err(TemplarError::Template("variables must be a mapping".into()));
                };
                for (name, expr) in vars {
                    let (Some(name), Some(expr)) = (name.as_str(), scalar_text(&expr)) else {
                        return Err(TemplarError::Template("variables must map names to scalar values".into()));
                    };
                    document.variables.push((name.to_string(), expr));
                }
            }
            other => {
                let Some(protocol) = ProtocolType::from_template_key(other) else {
                    debug!(key = other, "Ignoring unknown template key");
                    continue;
                };
                let YamlValue::Sequence(items) = value else {
                    return Err(TemplarError::Template(format!("{} must be a list of requests", other)));
                };
                for item in items {
                    let request = match protocol {
                        ProtocolType::Http => block::<HttpRequest>(item)?,
                        ProtocolType::Dns => block::<DnsRequest>(item)?,
                        ProtocolType::Network => block::<NetworkRequest>(item)?,
                    };
                    document.blocks.push((protocol, request));
                }
            }
        }
    }

    if !valid_id(&document.id) {
        return Err(TemplarError::Template(format!("invalid template id '{}'", document.id)));
    }
    if document.info.name.trim().is_empty() {
        return Err(TemplarError::Template(format!("template {} has no info.name", document.id)));
    }
    if document.blocks.is_empty() {
        return Err(TemplarError::Template(format!("template {} declares no requests", document.id)));
    }
    let mut ids = HashSet::new();
    for (_, request) in &document.blocks {
        if let Some(id) = request.id() {
            if !ids.insert(id.to_string()) {
                return Err(TemplarError::Template(format!(
                    "template {} declares request id '{}' twice",
                    document.id, id
                )));
            }
        }
    }
    Ok(document)
}

impl Template {
    /// Parse and compile a template from YAML text.
    pub fn parse(content: &str, path: Option<&Path>, resources: &ProtocolResources) -> Result<Self, TemplarError> {
        let document = parse_document(content)?;

        let mut protocols: Vec<ProtocolType> = Vec::new();
        for (protocol, _) in &document.blocks {
            if !protocols.contains(protocol) {
                protocols.push(*protocol);
            }
        }

        let mut options = ExecutorOptions::new(document.id.clone(), document.info.clone(), resources);
        options.template_path = path.map(Path::to_path_buf);
        options.variables = document.variables;
        options.flow = document.flow.clone();
        options.is_multi_protocol = document.flow.is_none() && protocols.len() > 1;
        options.stop_at_first_match |= document.stop_at_first_match;
        let options = Arc::new(options);

        let mut requests: RequestQueue = Vec::with_capacity(document.blocks.len());
        let mut total = 0;
        for (_, mut request) in document.blocks {
            request.compile(Arc::clone(&options))?;
            total += request.requests();
            requests.push(Arc::from(request));
        }

        let engine: Box<dyn TemplateEngine> = match &document.flow {
            Some(flow) => Box::new(FlowExecutor::new(requests, Arc::clone(&options), flow.clone())),
            None if options.is_multi_protocol => Box::new(MultiProtocol::new(requests, Arc::clone(&options))),
            None => Box::new(Generic::new(requests, Arc::clone(&options))),
        };
        let mut executer = TemplateExecuter::new(engine, options, total);
        executer.compile()?;

        debug!(
            template_id = %document.id,
            engine = executer.engine_name(),
            requests = total,
            "Compiled template"
        );
        Ok(Self {
            id: document.id,
            info: document.info,
            path: path.map(Path::to_path_buf),
            protocols,
            flow: document.flow,
            executer,
        })
    }

    /// Read, parse and compile the template at `path`.
    pub fn from_file(path: &Path, resources: &ProtocolResources) -> Result<Self, TemplarError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content, Some(path), resources)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Severity;
    use crate::protocols::testutil::resources;

    const MULTI: &str = r#"
id: multi-example
info:
  name: Multi example
  author: ops
  severity: high
  tags: dns,http
variables:
  marker: "{{to_upper(Host)}}"
dns:
  - name: "{{FQDN}}"
    type: A
http:
  - path: ["{{BaseURL}}/{{marker}}"]
    matchers:
      - type: status
        status: [200]
"#;

    #[test]
    fn test_parse_multi_protocol() {
        let template = Template::parse(MULTI, None, &resources()).unwrap();
        assert_eq!(template.id, "multi-example");
        assert_eq!(template.info.severity, Severity::High);
        assert_eq!(template.info.tags, vec!["dns", "http"]);
        assert_eq!(template.protocols, vec![ProtocolType::Dns, ProtocolType::Http]);
        assert_eq!(template.executer.engine_name(), "multiprotocol");
        assert!(template.executer.options().is_multi_protocol);
        assert_eq!(template.executer.requests(), 2);
    }

    #[test]
    fn test_engine_selection() {
        let generic = "id: g\ninfo: {name: G}\nhttp:\n  - path: ['{{BaseURL}}']\n  - path: ['{{BaseURL}}/x']\n";
        assert_eq!(Template::parse(generic, None, &resources()).unwrap().executer.engine_name(), "generic");

        let flow = "id: f\ninfo: {name: F}\nflow: http(1) && http(2)\nhttp:\n  - path: ['{{BaseURL}}']\n  - path: ['{{BaseURL}}/x']\n";
        let template = Template::parse(flow, None, &resources()).unwrap();
        assert_eq!(template.executer.engine_name(), "flow");
        assert_eq!(template.flow.as_deref(), Some("http(1) && http(2)"));

        let tcp = "id: n\ninfo: {name: N}\ntcp:\n  - inputs: [{data: 'PING'}]\n";
        let template = Template::parse(tcp, None, &resources()).unwrap();
        assert_eq!(template.protocols, vec![ProtocolType::Network]);
    }

    #[test]
    fn test_invalid_documents() {
        let res = resources();
        assert!(matches!(Template::parse("id: 'bad id'\ninfo: {name: x}\nhttp: [{path: ['/']}]\n", None, &res), Err(TemplarError::Template(_))));
        assert!(matches!(Template::parse("id: a\ninfo: {name: x}\n", None, &res), Err(TemplarError::Template(_))));
        assert!(matches!(Template::parse("id: a\nhttp: [{path: ['/']}]\n", None, &res), Err(TemplarError::Template(_))));
        let dup = "id: a\ninfo: {name: x}\nhttp:\n  - {id: one, path: ['/']}\n  - {id: one, path: ['/x']}\n";
        assert!(matches!(Template::parse(dup, None, &res), Err(TemplarError::Template(_))));
    }

    #[test]
    fn test_compile_errors_surface() {
        let undefined = "id: a\ninfo: {name: x}\nhttp:\n  - path: ['{{BaseURL}}/{{nope}}']\n";
        assert!(matches!(Template::parse(undefined, None, &resources()), Err(TemplarError::Compile(_))));
        let bad_flow = "id: a\ninfo: {name: x}\nflow: dns()\nhttp:\n  - path: ['{{BaseURL}}']\n";
        assert!(matches!(Template::parse(bad_flow, None, &resources()), Err(TemplarError::Compile(_))));
    }
}
