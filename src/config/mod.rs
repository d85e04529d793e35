pub mod duration;
pub mod filters;
pub mod parser;
pub mod types;

pub use filters::TemplateFilters;
pub use types::*;
pub use parser::{parse_config, parse_config_str};
