use clap::{Args, Parser, Subcommand};
use templar::models::Severity;
use templar::protocols::ProtocolType;

#[derive(Parser)]
#[command(name = "templar", version, about = "Template-driven vulnerability scanning engine")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase log verbosity (repeat for more)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run templates against targets
    Scan(ScanArgs),
    /// Compile templates and report errors without sending anything
    Validate(ValidateArgs),
}

#[derive(Args, Clone)]
pub struct ScanArgs {
    /// Template files or directories (repeatable)
    #[arg(short, long = "templates", required = true)]
    pub templates: Vec<String>,

    /// Target URL or host (repeatable)
    #[arg(short = 'u', long = "target")]
    pub targets: Vec<String>,

    /// File with one target per line
    #[arg(short, long)]
    pub list: Option<String>,

    /// YAML configuration file
    #[arg(short, long)]
    pub config: Option<String>,

    /// Write JSON lines results to this file instead of stdout
    #[arg(short, long)]
    pub output: Option<String>,

    /// Also write a markdown report to this file
    #[arg(long)]
    pub report: Option<String>,

    /// Maximum requests per second
    #[arg(long)]
    pub rate_limit: Option<u32>,

    /// Per-request timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Templates executed in parallel
    #[arg(long)]
    pub template_concurrency: Option<usize>,

    /// Targets executed in parallel per template
    #[arg(long)]
    pub host_concurrency: Option<usize>,

    /// Stop a template on a target after its first match
    #[arg(long)]
    pub stop_at_first_match: bool,

    /// Disable out-of-band interaction correlation
    #[arg(long)]
    pub no_interactsh: bool,

    #[command(flatten)]
    pub filters: FilterArgs,
}

/// Template filters; each flag is repeatable or comma separated.
#[derive(Args, Clone, Default)]
pub struct FilterArgs {
    /// Run only templates with one of these tags
    #[arg(long, value_delimiter = ',')]
    pub tags: Vec<String>,

    /// Skip templates with one of these tags
    #[arg(long, value_delimiter = ',')]
    pub exclude_tags: Vec<String>,

    /// Run templates with these tags even when otherwise excluded
    #[arg(long, value_delimiter = ',')]
    pub include_tags: Vec<String>,

    /// Run only these template ids
    #[arg(long = "id", value_delimiter = ',')]
    pub ids: Vec<String>,

    /// Skip these template ids
    #[arg(long = "exclude-id", value_delimiter = ',')]
    pub exclude_ids: Vec<String>,

    /// Run only templates by these authors
    #[arg(long = "author", value_delimiter = ',')]
    pub authors: Vec<String>,

    /// Run only templates of these severities
    #[arg(long = "severity", value_delimiter = ',')]
    pub severities: Vec<Severity>,

    /// Skip templates of these severities
    #[arg(long = "exclude-severity", value_delimiter = ',')]
    pub exclude_severities: Vec<Severity>,

    /// Run only templates using these protocols
    #[arg(long = "type", value_delimiter = ',')]
    pub protocol_types: Vec<ProtocolType>,

    /// Skip templates using these protocols
    #[arg(long = "exclude-type", value_delimiter = ',')]
    pub exclude_protocol_types: Vec<ProtocolType>,
}

#[derive(Args, Clone)]
pub struct ValidateArgs {
    /// Template files or directories (repeatable)
    #[arg(short, long = "templates", required = true)]
    pub templates: Vec<String>,

    /// YAML configuration file
    #[arg(short, long)]
    pub config: Option<String>,
}
