use serde::{Deserialize, Serialize};

use crate::models::{Severity, TemplateInfo};
use crate::protocols::ProtocolType;

/// Restricts which loaded templates are executed. Empty lists place no
/// restriction. `include-tags` re-admits templates that `exclude-tags` or
/// `exclude-ids` would otherwise drop.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TemplateFilters {
    /// Keep templates carrying at least one of these tags.
    pub tags: Vec<String>,
    pub exclude_tags: Vec<String>,
    pub include_tags: Vec<String>,
    pub ids: Vec<String>,
    pub exclude_ids: Vec<String>,
    pub authors: Vec<String>,
    pub severities: Vec<Severity>,
    pub exclude_severities: Vec<Severity>,
    pub protocol_types: Vec<ProtocolType>,
    pub exclude_protocol_types: Vec<ProtocolType>,
}

fn any_listed(values: &[String], list: &[String]) -> bool {
    values.iter().any(|v| list.iter().any(|l| l.eq_ignore_ascii_case(v)))
}

impl TemplateFilters {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Whether a template with this id, metadata and protocols passes.
    pub fn allows(&self, id: &str, info: &TemplateInfo, protocols: &[ProtocolType]) -> bool {
        let id = [id.to_string()];
        let forced = any_listed(&info.tags, &self.include_tags);

        if !forced && (any_listed(&info.tags, &self.exclude_tags) || any_listed(&id, &self.exclude_ids)) {
            return false;
        }
        if self.exclude_severities.contains(&info.severity) {
            return false;
        }
        if protocols.iter().any(|p| self.exclude_protocol_types.contains(p)) {
            return false;
        }

        (self.tags.is_empty() || any_listed(&info.tags, &self.tags))
            && (self.ids.is_empty() || any_listed(&id, &self.ids))
            && (self.authors.is_empty() || any_listed(&info.author, &self.authors))
            && (self.severities.is_empty() || self.severities.contains(&info.severity))
            && (self.protocol_types.is_empty() || protocols.iter().any(|p| self.protocol_types.contains(p)))
    }
}
