use std::path::PathBuf;
use tracing::{debug, info, warn};

use super::Template;
use crate::errors::TemplarError;
use crate::protocols::ProtocolResources;

/// Templates that compiled, and the per-file errors of those that did not.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub templates: Vec<Template>,
    pub errors: Vec<(PathBuf, TemplarError)>,
    /// Templates that loaded but were dropped by the configured filters.
    pub filtered: usize,
}

impl LoadReport {
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

/// Expand `inputs` (files or directories) through the catalog and compile
/// every template found. A template that fails to load is reported and
/// skipped; it never prevents the others from loading. Templates rejected by
/// the engine's template filters are counted and dropped.
pub fn load_templates(inputs: &[String], resources: &ProtocolResources) -> Result<LoadReport, TemplarError> {
    let paths = resources.catalog.get_templates_path(inputs)?;
    let mut report = LoadReport::default();
    let mut seen = std::collections::HashSet::new();
    let filters = &resources.options.filters;

    for path in paths {
        match Template::from_file(&path, resources) {
            Ok(template) => {
                if !filters.allows(&template.id, &template.info, &template.protocols) {
                    debug!(template_id = %template.id, "Template excluded by filters");
                    report.filtered += 1;
                    continue;
                }
                if !seen.insert(template.id.clone()) {
                    warn!(template_id = %template.id, path = %path.display(), "Duplicate template id, skipping");
                    continue;
                }
                report.templates.push(template);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to load template");
                report.errors.push((path, e));
            }
        }
    }

    info!(
        loaded = report.templates.len(),
        failed = report.errors.len(),
        filtered = report.filtered,
        "Templates loaded"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::DiskCatalog;
    use crate::config::{EngineOptions, TemplateFilters};
    use crate::models::Severity;
    use std::sync::Arc;

    fn write_templates(dir: &std::path::Path) {
        let templates = [
            ("cve.yaml", "id: cve-check\ninfo: {name: CVE, author: alice, severity: critical, tags: [cve, rce]}\nhttp:\n  - path: ['{{BaseURL}}/']\n"),
            ("panel.yaml", "id: panel-check\ninfo: {name: Panel, author: bob, severity: info, tags: [panel]}\nhttp:\n  - path: ['{{BaseURL}}/admin']\n"),
            ("dns.yaml", "id: dns-check\ninfo: {name: DNS, author: alice, severity: low, tags: [dns]}\ndns:\n  - name: '{{FQDN}}'\n"),
        ];
        for (name, body) in templates {
            std::fs::write(dir.join(name), body).unwrap();
        }
    }

    fn load_with(dir: &std::path::Path, filters: TemplateFilters) -> LoadReport {
        let options = EngineOptions { filters, ..EngineOptions::for_tests() };
        let catalog = Arc::new(DiskCatalog::new(dir, false));
        let resources = ProtocolResources::new(Arc::new(options), catalog);
        load_templates(&[dir.display().to_string()], &resources).unwrap()
    }

    fn ids(report: &LoadReport) -> Vec<&str> {
        let mut ids: Vec<_> = report.templates.iter().map(|t| t.id.as_str()).collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_include_filters_keep_matching_templates() {
        let dir = tempfile::tempdir().unwrap();
        write_templates(dir.path());

        let report = load_with(dir.path(), TemplateFilters { tags: vec!["cve".into()], ..Default::default() });
        assert_eq!(ids(&report), vec!["cve-check"]);
        assert_eq!(report.filtered, 2);

        let report = load_with(dir.path(), TemplateFilters { authors: vec!["alice".into()], ..Default::default() });
        assert_eq!(ids(&report), vec!["cve-check", "dns-check"]);

        let report = load_with(dir.path(), TemplateFilters { ids: vec!["panel-check".into()], ..Default::default() });
        assert_eq!(ids(&report), vec!["panel-check"]);
    }

    #[test]
    fn test_exclude_filters_drop_matching_templates() {
        let dir = tempfile::tempdir().unwrap();
        write_templates(dir.path());

        let filters = TemplateFilters {
            exclude_severities: vec![Severity::Info],
            exclude_tags: vec!["dns".into()],
            ..Default::default()
        };
        let report = load_with(dir.path(), filters);
        assert_eq!(ids(&report), vec!["cve-check"]);
        assert_eq!(report.filtered, 2);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn test_bad_template_does_not_block_others() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("good.yaml"),
            "id: good\ninfo: {name: Good}\nhttp:\n  - path: ['{{BaseURL}}/']\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("bad.yaml"),
            "id: bad\ninfo: {name: Bad}\nhttp:\n  - path: ['{{BaseURL}}/{{undefined}}']\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a template").unwrap();

        let catalog = Arc::new(DiskCatalog::new(dir.path(), false));
        let resources = ProtocolResources::new(Arc::new(EngineOptions::for_tests()), catalog);
        let report = load_templates(&[dir.path().display().to_string()], &resources).unwrap();

        assert_eq!(report.templates.len(), 1);
        assert_eq!(report.templates[0].id, "good");
        assert_eq!(report.errors.len(), 1);
        assert!(matches!(report.errors[0].1, TemplarError::Compile(_)));
    }
}
