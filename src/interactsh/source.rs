use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{json, Value};
use std::sync::Mutex;
use tracing::debug;

use super::{Interaction, InteractshOptions};
use crate::errors::TemplarError;

pub(crate) fn random_id(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect()
}

/// Identity assigned to this client by the correlation server.
#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub correlation_id: String,
    pub secret: String,
    /// Domain suffix interaction URLs are built under.
    pub server_host: String,
}

/// Where interactions come from.
#[async_trait]
pub trait InteractionSource: Send + Sync {
    async fn register(&self) -> Result<Registration, TemplarError>;

    /// Fetch interactions received since the last poll.
    async fn poll(&self, registration: &Registration) -> Result<Vec<Interaction>, TemplarError>;

    async fn deregister(&self, registration: &Registration) -> Result<(), TemplarError>;
}

/// Polls a correlation server over HTTP with JSON bodies.
pub struct HttpPollSource {
    client: reqwest::Client,
    server_url: String,
    server_host: String,
    authorization: Option<String>,
    correlation_id: String,
    secret: String,
}

impl HttpPollSource {
    pub fn new(options: &InteractshOptions) -> Result<Self, TemplarError> {
        let server_url = options.server_url.trim_end_matches('/').to_string();
        let parsed = url::Url::parse(&server_url)
            .map_err(|e| TemplarError::Config(format!("invalid interactsh server-url '{}': {}", server_url, e)))?;
        let server_host = parsed
            .host_str()
            .ok_or_else(|| TemplarError::Config(format!("interactsh server-url '{}' has no host", server_url)))?
            .to_string();
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| TemplarError::Config(format!("Failed to build interactsh HTTP client: {}", e)))?;

        Ok(Self {
            client,
            server_url,
            server_host,
            authorization: options.authorization.clone(),
            correlation_id: random_id(20),
            secret: random_id(32),
        })
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.authorization {
            Some(token) => builder.header("Authorization", token),
            None => builder,
        }
    }

    fn check_status(response: &reqwest::Response, action: &str) -> Result<(), TemplarError> {
        if response.status().is_success() {
            Ok(())
        } else {
            Err(TemplarError::Interactsh(format!("{} failed with status {}", action, response.status())))
        }
    }
}

/// Poll responses carry a `data` array of interaction objects, or of
/// strings holding serialized interactions.
fn parse_poll_body(body: &Value) -> Vec<Interaction> {
    let Some(items) = body.get("data").and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let parsed = match item {
                Value::String(text) => serde_json::from_str::<Interaction>(text),
                other => serde_json::from_value::<Interaction>(other.clone()),
            };
            parsed.map_err(|e| debug!(error = %e, "Skipping malformed interaction")).ok()
        })
        .collect()
}

#[async_trait]
impl InteractionSource for HttpPollSource {
    async fn register(&self) -> Result<Registration, TemplarError> {
        let body = json!({"correlation-id": self.correlation_id, "secret-key": self.secret});
        let response = self
            .request(self.client.post(format!("{}/register", self.server_url)))
            .json(&body)
            .send()
            .await?;
        Self::check_status(&response, "register")?;
        Ok(Registration {
            correlation_id: self.correlation_id.clone(),
            secret: self.secret.clone(),
            server_host: self.server_host.clone(),
        })
    }

    async fn poll(&self, registration: &Registration) -> Result<Vec<Interaction>, TemplarError> {
        let response = self
            .request(self.client.get(format!("{}/poll", self.server_url)))
            .query(&[("id", registration.correlation_id.as_str()), ("secret", registration.secret.as_str())])
            .send()
            .await?;
        Self::check_status(&response, "poll")?;
        let body: Value = response.json().await?;
        Ok(parse_poll_body(&body))
    }

    async fn deregister(&self, registration: &Registration) -> Result<(), TemplarError> {
        let body = json!({"correlation-id": registration.correlation_id, "secret-key": registration.secret});
        let response = self
            .request(self.client.post(format!("{}/deregister", self.server_url)))
            .json(&body)
            .send()
            .await?;
        Self::check_status(&response, "deregister")
    }
}

/// In-process source fed by [`QueueSource::push`]. Used when interactions
/// are delivered by something other than a remote server, and in tests.
pub struct QueueSource {
    registration: Registration,
    pending: Mutex<Vec<Interaction>>,
}

impl QueueSource {
    pub fn new(server_host: impl Into<String>) -> Self {
        Self {
            registration: Registration {
                correlation_id: random_id(20),
                secret: random_id(32),
                server_host: server_host.into(),
            },
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, interaction: Interaction) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.push(interaction);
        }
    }
}

#[async_trait]
impl InteractionSource for QueueSource {
    async fn register(&self) -> Result<Registration, TemplarError> {
        Ok(self.registration.clone())
    }

    async fn poll(&self, _registration: &Registration) -> Result<Vec<Interaction>, TemplarError> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| TemplarError::Internal("interaction queue lock poisoned".into()))?;
        Ok(std::mem::take(&mut *pending))
    }

    async fn deregister(&self, _registration: &Registration) -> Result<(), TemplarError> {
        Ok(())
    }
}
