use anyhow::{bail, Context};
use std::sync::Arc;

use templar::protocols::ProtocolResources;
use templar::templates::load_templates;

use super::commands::ValidateArgs;

pub async fn handle_validate(args: ValidateArgs) -> anyhow::Result<()> {
    let options = Arc::new(super::load_options(args.config.as_deref()).await?);
    let resources = ProtocolResources::new(Arc::clone(&options), super::catalog(&options));
    let report = load_templates(&args.templates, &resources).context("Failed to expand template inputs")?;

    for template in &report.templates {
        println!(
            "ok    {} [{}] {} request(s), {} engine",
            template.id,
            template.protocols.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(","),
            template.executer.requests(),
            template.executer.engine_name()
        );
    }
    for (path, error) in &report.errors {
        println!("error {}: {}", path.display(), error);
    }

    if !report.errors.is_empty() {
        bail!("{} of {} template(s) failed to compile", report.errors.len(), report.errors.len() + report.templates.len());
    }
    Ok(())
}
