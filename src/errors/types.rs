use thiserror::Error;

#[derive(Debug, Error)]
pub enum TemplarError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Compile error: {0}")]
    Compile(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Sandbox violation: {0}")]
    Sandbox(String),

    #[error("Unresolved variables: {0}")]
    UnresolvedVariables(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Skipped due to host errors: {0}")]
    HostSkipped(String),

    #[error("Expression error: {0}")]
    Expression(String),

    #[error("Flow error: {0}")]
    Flow(String),

    #[error("Interactsh error: {0}")]
    Interactsh(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<reqwest::Error> for TemplarError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            TemplarError::Timeout(error.to_string())
        } else if error.is_connect() || error.is_request() {
            TemplarError::Network(error.to_string())
        } else {
            TemplarError::Protocol(error.to_string())
        }
    }
}

impl From<hickory_resolver::ResolveError> for TemplarError {
    fn from(error: hickory_resolver::ResolveError) -> Self {
        TemplarError::Network(error.to_string())
    }
}

impl From<crate::dsl::DslError> for TemplarError {
    fn from(error: crate::dsl::DslError) -> Self {
        TemplarError::Expression(error.to_string())
    }
}
