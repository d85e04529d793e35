//! Out-of-band interaction correlation.
//!
//! Requests that embed `{{interactsh-url}}` get a unique subdomain under the
//! correlation server. The request's response event is parked in a TTL-bounded
//! LRU keyed by that subdomain; a background poller pulls interactions from
//! the server and replays the parked event through its operators with the
//! interaction data attached.

mod options;
pub mod source;

pub use options::InteractshOptions;
pub use source::{HttpPollSource, InteractionSource, QueueSource, Registration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::TtlLruCache;
use crate::errors::{with_retry, RetryConfig, TemplarError};
use crate::operators::{self, Operators};
use crate::output::{InternalEvent, InternalWrappedEvent, OutputWriter};
use crate::protocols::{eventcreator, ProtocolType};

/// Placeholder replaced by a fresh interaction URL.
pub const MARKER: &str = "{{interactsh-url}}";

const NONCE_LENGTH: usize = 13;

/// One callback received by the correlation server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Interaction {
    pub protocol: String,
    #[serde(default)]
    pub unique_id: String,
    #[serde(default)]
    pub full_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub q_type: Option<String>,
    #[serde(default)]
    pub raw_request: String,
    #[serde(default)]
    pub raw_response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smtp_from: Option<String>,
    #[serde(default)]
    pub remote_address: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Interaction {
    pub fn new(protocol: &str, unique_id: &str) -> Self {
        Self {
            protocol: protocol.to_string(),
            unique_id: unique_id.to_string(),
            full_id: unique_id.to_string(),
            q_type: None,
            raw_request: String::new(),
            raw_response: String::new(),
            smtp_from: None,
            remote_address: String::new(),
            timestamp: Utc::now(),
        }
    }
}

/// A response event waiting for its interaction.
#[derive(Debug, Clone)]
pub struct RequestData {
    pub event: InternalEvent,
    pub operators: Operators,
    pub protocol: ProtocolType,
    pub default_part: &'static str,
}

/// A parked request with every interaction id it was registered under.
/// One request yields at most one result, whichever id calls back first.
struct Parked {
    data: RequestData,
    ids: Vec<String>,
    done: AtomicBool,
}

/// Whether any matcher of `operators` reads interaction data.
pub fn has_interaction_matchers(operators: &Operators) -> bool {
    operators.matchers.iter().any(|m| {
        m.part.starts_with("interactsh") || m.dsl.iter().any(|expr| expr.contains("interactsh_"))
    })
}

pub fn has_markers(text: &str) -> bool {
    text.contains(MARKER)
}

pub struct InteractshClient {
    options: InteractshOptions,
    source: Arc<dyn InteractionSource>,
    output: Arc<dyn OutputWriter>,
    registration: Registration,
    requests: TtlLruCache<String, Arc<Parked>>,
    early: TtlLruCache<String, Vec<Interaction>>,
    cancel: CancellationToken,
    poller: Mutex<Option<JoinHandle<()>>>,
    matched: AtomicUsize,
}

impl InteractshClient {
    /// Register with the configured correlation server over HTTP.
    pub async fn new(options: InteractshOptions, output: Arc<dyn OutputWriter>) -> Result<Self, TemplarError> {
        if options.no_interactsh {
            return Err(TemplarError::Interactsh("interaction correlation is disabled".into()));
        }
        let source = Arc::new(HttpPollSource::new(&options)?);
        Self::with_source(options, source, output).await
    }

    pub async fn with_source(
        options: InteractshOptions,
        source: Arc<dyn InteractionSource>,
        output: Arc<dyn OutputWriter>,
    ) -> Result<Self, TemplarError> {
        let registration = with_retry("interactsh_register", &RetryConfig::default(), || source.register()).await?;
        info!(server = %registration.server_host, "Registered with interaction server");

        Ok(Self {
            requests: TtlLruCache::new(options.cache_size, options.eviction),
            early: TtlLruCache::new(options.cache_size, options.eviction),
            options,
            source,
            output,
            registration,
            cancel: CancellationToken::new(),
            poller: Mutex::new(None),
            matched: AtomicUsize::new(0),
        })
    }

    /// A fresh interaction URL: correlation id, nonce, server host.
    pub fn new_url(&self) -> String {
        format!(
            "{}{}.{}",
            self.registration.correlation_id,
            source::random_id(NONCE_LENGTH),
            self.registration.server_host
        )
    }

    /// Replace every marker in `text` with its own URL, appending the URLs to `urls`.
    pub fn replace_markers(&self, text: &str, urls: &mut Vec<String>) -> String {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(pos) = rest.find(MARKER) {
            out.push_str(&rest[..pos]);
            let url = self.new_url();
            out.push_str(&url);
            urls.push(url);
            rest = &rest[pos + MARKER.len()..];
        }
        out.push_str(rest);
        out
    }

    /// Park `data` until an interaction for one of `urls` arrives.
    /// Interactions that arrived before the registration are processed now.
    pub fn register(&self, urls: &[String], data: RequestData) {
        let ids: Vec<String> = urls.iter().map(|url| unique_id(url)).collect();
        let parked = Arc::new(Parked { data, ids: ids.clone(), done: AtomicBool::new(false) });
        for id in &ids {
            self.requests.insert(id.clone(), Arc::clone(&parked));
        }
        for id in &ids {
            let Some(pending) = self.early.remove(id) else { continue };
            for interaction in pending {
                if self.process_interaction(interaction) > 0 {
                    return;
                }
            }
        }
    }

    /// Correlate one interaction. Returns the number of result events written.
    pub fn process_interaction(&self, interaction: Interaction) -> usize {
        let id = interaction.unique_id.to_ascii_lowercase();
        let Some(parked) = self.requests.get(&id) else {
            debug!(id = %id, protocol = %interaction.protocol, "Interaction without a registered request");
            self.early.upsert(id, Vec::new(), |pending| pending.push(interaction));
            return 0;
        };

        let data = &parked.data;
        let mut event = data.event.clone();
        event.insert("interactsh_protocol".into(), Value::String(interaction.protocol.clone()));
        event.insert("interactsh_request".into(), Value::String(interaction.raw_request.clone()));
        event.insert("interactsh_response".into(), Value::String(interaction.raw_response.clone()));
        event.insert("interactsh_ip".into(), Value::String(interaction.remote_address.clone()));

        let default_part = data.default_part;
        let result = data.operators.execute(
            &mut event,
            |d, m| operators::default_match(d, m, default_part),
            |d, e| operators::default_extract(d, e, default_part),
        );
        let Some(result) = result.filter(|r| r.matched) else {
            return 0;
        };
        if parked.done.swap(true, Ordering::SeqCst) {
            return 0;
        }
        for sibling in &parked.ids {
            self.requests.remove(sibling);
        }

        let mut wrapped = InternalWrappedEvent::new(event);
        wrapped.operators_result = Some(result);
        wrapped.uses_interactsh = true;
        let mut results = eventcreator::make_default_result_event(&wrapped, |w| {
            eventcreator::default_result_item(w, data.protocol)
        });

        let mut written = 0;
        for result in &mut results {
            result.interaction = Some(interaction.clone());
            match self.output.write(result) {
                Ok(()) => written += 1,
                Err(e) => warn!(template_id = %result.template_id, error = %e, "Failed to write interaction result"),
            }
        }
        self.matched.fetch_add(written, Ordering::Relaxed);
        written
    }

    /// Fetch and correlate one batch of interactions.
    pub async fn poll_once(&self) -> usize {
        let mut written = 0;
        match self.source.poll(&self.registration).await {
            Ok(interactions) => {
                for interaction in interactions {
                    written += self.process_interaction(interaction);
                }
            }
            Err(e) => warn!(server = %self.registration.server_host, error = %e, "Interaction poll failed"),
        }
        self.requests.purge_expired();
        self.early.purge_expired();
        written
    }

    /// Spawn the background poller. Calling it again is a no-op.
    pub fn start_polling(self: &Arc<Self>) {
        let Ok(mut poller) = self.poller.lock() else {
            return;
        };
        if poller.is_some() {
            return;
        }
        let client = Arc::clone(self);
        *poller = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(client.options.poll_interval);
            loop {
                tokio::select! {
                    _ = client.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        client.poll_once().await;
                    }
                }
            }
        }));
    }

    /// Keep polling through the cooldown window, then stop and deregister.
    pub async fn close(&self) {
        if !self.requests.is_empty() && !self.options.cooldown.is_zero() {
            debug!(pending = self.requests.len(), cooldown = ?self.options.cooldown, "Waiting for late interactions");
            tokio::time::sleep(self.options.cooldown).await;
        }
        self.poll_once().await;
        self.cancel.cancel();

        let handle = self.poller.lock().ok().and_then(|mut poller| poller.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        if let Err(e) = self.source.deregister(&self.registration).await {
            warn!(error = %e, "Failed to deregister from interaction server");
        }
    }

    pub fn matched(&self) -> usize {
        self.matched.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        self.requests.len()
    }
}

fn unique_id(url: &str) -> String {
    url.split('.').next().unwrap_or(url).to_ascii_lowercase()
}
