use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};

use super::Catalog;
use crate::errors::TemplarError;

/// Catalog backed by the local filesystem.
///
/// Without local file access enabled, paths must resolve inside the
/// templates directory; the current working directory is not allowed either.
#[derive(Debug, Clone)]
pub struct DiskCatalog {
    templates_directory: PathBuf,
    allow_local_file_access: bool,
}

impl DiskCatalog {
    pub fn new(templates_directory: impl Into<PathBuf>, allow_local_file_access: bool) -> Self {
        let templates_directory = templates_directory.into();
        let templates_directory =
            std::fs::canonicalize(&templates_directory).unwrap_or(templates_directory);
        Self { templates_directory, allow_local_file_access }
    }

    pub fn templates_directory(&self) -> &Path {
        &self.templates_directory
    }

    fn within_sandbox(&self, path: &Path) -> bool {
        self.allow_local_file_access || path.starts_with(&self.templates_directory)
    }

    fn sandboxed(&self, candidate: PathBuf) -> Result<PathBuf, TemplarError> {
        let cleaned = clean(&candidate);
        let resolved = std::fs::canonicalize(&cleaned).unwrap_or(cleaned);
        if self.within_sandbox(&resolved) {
            Ok(resolved)
        } else {
            Err(TemplarError::Sandbox(format!(
                "path {} is outside the templates directory and local file access is not enabled",
                candidate.display()
            )))
        }
    }
}

/// Lexically resolve `.` and `..` components.
fn clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

impl Catalog for DiskCatalog {
    fn resolve_path(&self, path: &str, template_path: Option<&Path>) -> Result<PathBuf, TemplarError> {
        let raw = Path::new(path);
        if raw.is_absolute() {
            return self.sandboxed(raw.to_path_buf());
        }

        if let Some(dir) = template_path.and_then(Path::parent) {
            let candidate = dir.join(raw);
            if candidate.exists() {
                if let Ok(resolved) = self.sandboxed(candidate) {
                    return Ok(resolved);
                }
            }
        }

        let candidate = self.templates_directory.join(raw);
        if candidate.exists() {
            return self.sandboxed(candidate);
        }

        if self.allow_local_file_access && raw.exists() {
            return Ok(raw.to_path_buf());
        }

        Err(TemplarError::Compile(format!("could not find file {}", path)))
    }

    fn open_file(&self, path: &Path) -> Result<Box<dyn BufRead + Send>, TemplarError> {
        let resolved = self.sandboxed(path.to_path_buf())?;
        debug!(path = %resolved.display(), "Opening catalog file");
        let file = File::open(&resolved)?;
        Ok(Box::new(BufReader::new(file)))
    }

    fn get_templates_path(&self, inputs: &[String]) -> Result<Vec<PathBuf>, TemplarError> {
        let mut paths = Vec::new();
        for input in inputs {
            let path = PathBuf::from(input);
            let path = if path.exists() { path } else { self.templates_directory.join(input) };

            if path.is_dir() {
                for pattern in ["**/*.yaml", "**/*.yml"] {
                    let pattern = path.join(pattern);
                    let entries = glob::glob(&pattern.to_string_lossy())
                        .map_err(|e| TemplarError::Config(format!("Invalid glob pattern: {}", e)))?;
                    for entry in entries {
                        match entry {
                            Ok(found) => paths.push(found),
                            Err(e) => warn!(error = %e, "Skipping unreadable template path"),
                        }
                    }
                }
            } else if path.is_file() {
                paths.push(path);
            } else {
                return Err(TemplarError::Config(format!("Template not found: {}", input)));
            }
        }
        paths.sort();
        paths.dedup();
        Ok(paths)
    }
}
