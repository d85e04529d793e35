mod disk;

pub use disk::DiskCatalog;

use std::io::BufRead;
use std::path::{Path, PathBuf};

use crate::errors::TemplarError;

/// File access for templates and their payload files.
pub trait Catalog: Send + Sync {
    /// Resolve `path` against the sandbox. Relative paths are tried next to
    /// `template_path` first, then under the templates directory.
    fn resolve_path(&self, path: &str, template_path: Option<&Path>) -> Result<PathBuf, TemplarError>;

    /// Open a sandboxed file for reading.
    fn open_file(&self, path: &Path) -> Result<Box<dyn BufRead + Send>, TemplarError>;

    /// Expand template files and directories (`.yaml` / `.yml`) into template paths.
    fn get_templates_path(&self, inputs: &[String]) -> Result<Vec<PathBuf>, TemplarError>;
}

/// Read every non-empty line of a sandboxed file.
pub fn read_lines(catalog: &dyn Catalog, path: &Path) -> Result<Vec<String>, TemplarError> {
    let reader = catalog.open_file(path)?;
    let mut lines = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim_end_matches('\r');
        if !trimmed.is_empty() {
            lines.push(trimmed.to_string());
        }
    }
    Ok(lines)
}
