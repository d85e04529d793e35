//! Scan targets and the per-scan variable context.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio_util::sync::CancellationToken;
use url::Url;

/// Names of the variables [`MetaInput::variables`] provides.
pub const TARGET_VARIABLES: &[&str] =
    &["BaseURL", "RootURL", "Hostname", "Host", "Port", "Path", "File", "Scheme", "FQDN", "input"];

/// One scan target as given by the user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetaInput {
    pub input: String,
    /// Address to connect to instead of resolving the input host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_ip: Option<String>,
}

/// Target decomposed into URL parts.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Parts {
    scheme: String,
    host: String,
    port: u16,
    explicit_port: bool,
    path: String,
}

impl MetaInput {
    pub fn new(input: impl Into<String>) -> Self {
        Self { input: input.into().trim().to_string(), custom_ip: None }
    }

    fn parts(&self) -> Option<Parts> {
        let with_scheme = if self.input.contains("://") {
            self.input.clone()
        } else {
            format!("http://{}", self.input)
        };
        let url = Url::parse(&with_scheme).ok()?;
        let host = url.host_str()?.trim_start_matches('[').trim_end_matches(']').to_string();
        let port = url.port_or_known_default().unwrap_or(80);
        Some(Parts {
            scheme: url.scheme().to_string(),
            host,
            port,
            explicit_port: url.port().is_some(),
            path: url.path().trim_end_matches('/').to_string(),
        })
    }

    /// Host without port. Falls back to the raw input when it does not parse.
    pub fn host(&self) -> String {
        self.parts().map(|p| p.host).unwrap_or_else(|| self.input.clone())
    }

    pub fn port(&self) -> Option<u16> {
        self.parts().map(|p| p.port)
    }

    /// `host:port` key used to track errors per host.
    pub fn host_key(&self) -> String {
        match self.parts() {
            Some(p) => format!("{}:{}", p.host, p.port),
            None => self.input.clone(),
        }
    }

    /// Built-in variables available to every request: `BaseURL`, `RootURL`,
    /// `Hostname`, `Host`, `Port`, `Path`, `File`, `Scheme`, `FQDN`, `input`.
    pub fn variables(&self) -> Map<String, Value> {
        let mut vars = Map::new();
        vars.insert("input".into(), Value::String(self.input.clone()));
        let Some(parts) = self.parts() else {
            vars.insert("Host".into(), Value::String(self.input.clone()));
            vars.insert("Hostname".into(), Value::String(self.input.clone()));
            vars.insert("FQDN".into(), Value::String(self.input.clone()));
            return vars;
        };
        let host_for_url = if parts.host.contains(':') { format!("[{}]", parts.host) } else { parts.host.clone() };
        let hostname = if parts.explicit_port {
            format!("{}:{}", host_for_url, parts.port)
        } else {
            host_for_url
        };
        let root = format!("{}://{}", parts.scheme, hostname);
        let file = parts.path.rsplit('/').next().unwrap_or_default().to_string();

        vars.insert("BaseURL".into(), Value::String(format!("{}{}", root, parts.path)));
        vars.insert("RootURL".into(), Value::String(root));
        vars.insert("Hostname".into(), Value::String(hostname));
        vars.insert("Host".into(), Value::String(parts.host.clone()));
        vars.insert("Port".into(), Value::String(parts.port.to_string()));
        vars.insert("Path".into(), Value::String(parts.path));
        vars.insert("File".into(), Value::String(file));
        vars.insert("Scheme".into(), Value::String(parts.scheme));
        vars.insert("FQDN".into(), Value::String(parts.host));
        vars
    }
}

impl fmt::Display for MetaInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.input)
    }
}

impl From<&str> for MetaInput {
    fn from(input: &str) -> Self {
        Self::new(input)
    }
}

/// Mutable key/value bag shared by the requests of one scan unit.
///
/// Only the sequential execution path of the scan unit writes to it; the
/// lock exists so the flow interpreter thread can read snapshots.
#[derive(Debug, Clone, Default)]
pub struct Context {
    inner: Arc<RwLock<Map<String, Value>>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Map<String, Value>> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Map<String, Value>> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.read().get(key).cloned()
    }

    pub fn has(&self, key: &str) -> bool {
        self.read().contains_key(key)
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.write().insert(key.into(), value);
    }

    pub fn merge(&self, values: &Map<String, Value>) {
        let mut inner = self.write();
        for (key, value) in values {
            inner.insert(key.clone(), value.clone());
        }
    }

    pub fn all(&self) -> Map<String, Value> {
        self.read().clone()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether both handles refer to the same underlying bag.
    pub fn same_as(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Everything a request needs to know about the scan unit it runs in.
#[derive(Debug, Clone)]
pub struct ScanContext {
    pub input: MetaInput,
    pub ctx: Context,
    pub cancel: CancellationToken,
}

impl ScanContext {
    pub fn new(input: MetaInput, ctx: Context, cancel: CancellationToken) -> Self {
        Self { input, ctx, cancel }
    }

    /// A standalone scan context, for running a request outside an executer.
    pub fn detached(input: impl Into<String>) -> Self {
        Self::new(MetaInput::new(input), Context::new(), CancellationToken::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(vars: &Map<String, Value>, key: &str) -> String {
        vars[key].as_str().unwrap().to_string()
    }

    #[test]
    fn test_url_variables() {
        let vars = MetaInput::new("https://example.com:8443/app/login.php").variables();
        assert_eq!(var(&vars, "BaseURL"), "https://example.com:8443/app/login.php");
        assert_eq!(var(&vars, "RootURL"), "https://example.com:8443");
        assert_eq!(var(&vars, "Hostname"), "example.com:8443");
        assert_eq!(var(&vars, "Host"), "example.com");
        assert_eq!(var(&vars, "Port"), "8443");
        assert_eq!(var(&vars, "File"), "login.php");
        assert_eq!(var(&vars, "Scheme"), "https");
    }

    #[test]
    fn test_bare_host_variables() {
        let input = MetaInput::new("scanme.sh");
        let vars = input.variables();
        assert_eq!(var(&vars, "FQDN"), "scanme.sh");
        assert_eq!(var(&vars, "BaseURL"), "http://scanme.sh");
        assert_eq!(var(&vars, "Port"), "80");
        assert_eq!(input.host_key(), "scanme.sh:80");
    }

    #[test]
    fn test_host_key_includes_port() {
        assert_eq!(MetaInput::new("127.0.0.1:9000").host_key(), "127.0.0.1:9000");
        assert_eq!(MetaInput::new("https://a.com/x").host_key(), "a.com:443");
    }

    #[test]
    fn test_context_shared_between_clones() {
        let ctx = Context::new();
        let clone = ctx.clone();
        clone.set("http_status_code", Value::from(200));
        assert_eq!(ctx.get("http_status_code"), Some(Value::from(200)));
        assert!(ctx.same_as(&clone));
        assert!(!ctx.same_as(&Context::new()));
    }
}
