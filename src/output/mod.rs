//! Events produced by protocol backends and the sinks that receive them.

pub mod writer;

pub use writer::{ChannelWriter, JsonLinesWriter, MemoryWriter, OutputWriter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::interactsh::Interaction;
use crate::models::TemplateInfo;
use crate::operators::OperatorsResult;

/// Flattened response data a backend produces for one request. Matchers,
/// extractors and DSL expressions read from it by key.
pub type InternalEvent = Map<String, Value>;

/// A response event together with the outcome of its operators and the
/// result events synthesized from it.
#[derive(Debug, Clone, Default)]
pub struct InternalWrappedEvent {
    pub internal_event: InternalEvent,
    pub operators_result: Option<OperatorsResult>,
    pub results: Vec<ResultEvent>,
    /// Set when the request embedded an interaction URL; results for this
    /// event may still arrive through the interaction poller.
    pub uses_interactsh: bool,
}

impl InternalWrappedEvent {
    pub fn new(internal_event: InternalEvent) -> Self {
        Self { internal_event, ..Default::default() }
    }

    pub fn has_operator_result(&self) -> bool {
        self.operators_result.is_some()
    }

    pub fn has_results(&self) -> bool {
        !self.results.is_empty()
    }

    pub fn matched(&self) -> bool {
        self.operators_result.as_ref().map(|r| r.matched).unwrap_or(false)
    }

    /// String field of the internal event, empty when absent.
    pub fn field(&self, key: &str) -> String {
        self.internal_event.get(key).map(crate::dsl::to_text).unwrap_or_default()
    }
}

/// A finding, as written to output sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ResultEvent {
    pub template_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_path: Option<String>,
    pub info: TemplateInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matcher_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extractor_name: Option<String>,
    /// Protocol of the request that produced the event.
    #[serde(rename = "type")]
    pub protocol: String,
    pub host: String,
    pub matched_at: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extracted_results: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub payload: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interaction: Option<Interaction>,
    pub timestamp: DateTime<Utc>,
    pub matcher_status: bool,
}
