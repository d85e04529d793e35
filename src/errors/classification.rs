use super::types::TemplarError;

#[derive(Debug, Clone)]
pub struct ErrorClassification {
    pub error_type: &'static str,
    /// The unit of work (one target) may continue after this error.
    pub recoverable: bool,
    /// The error counts toward the per-host error threshold.
    pub host_error: bool,
}

impl TemplarError {
    /// Classify this error to decide whether it halts the current unit of work
    /// and whether it counts against the target host.
    pub fn classify(&self) -> ErrorClassification {
        match self {
            // Per-request runtime errors: recorded, counted per host
            TemplarError::Network(_) => ErrorClassification {
                error_type: "NetworkError",
                recoverable: true,
                host_error: true,
            },
            TemplarError::Timeout(_) => ErrorClassification {
                error_type: "TimeoutError",
                recoverable: true,
                host_error: true,
            },
            TemplarError::Io(_) => ErrorClassification {
                error_type: "IoError",
                recoverable: true,
                host_error: true,
            },

            // Recoverable, not the host's fault
            TemplarError::Protocol(_) => ErrorClassification {
                error_type: "ProtocolError",
                recoverable: true,
                host_error: false,
            },
            TemplarError::UnresolvedVariables(_) => ErrorClassification {
                error_type: "UnresolvedVariablesError",
                recoverable: true,
                host_error: false,
            },
            TemplarError::HostSkipped(_) => ErrorClassification {
                error_type: "HostSkipped",
                recoverable: true,
                host_error: false,
            },
            TemplarError::Expression(_) => ErrorClassification {
                error_type: "ExpressionError",
                recoverable: true,
                host_error: false,
            },
            TemplarError::Interactsh(_) => ErrorClassification {
                error_type: "InteractshError",
                recoverable: true,
                host_error: false,
            },
            TemplarError::Json(_) => ErrorClassification {
                error_type: "JsonError",
                recoverable: true,
                host_error: false,
            },

            // Halt the unit of work
            TemplarError::Config(_) => ErrorClassification {
                error_type: "ConfigError",
                recoverable: false,
                host_error: false,
            },
            TemplarError::Compile(_) => ErrorClassification {
                error_type: "CompileError",
                recoverable: false,
                host_error: false,
            },
            TemplarError::Template(_) => ErrorClassification {
                error_type: "TemplateError",
                recoverable: false,
                host_error: false,
            },
            TemplarError::Sandbox(_) => ErrorClassification {
                error_type: "SandboxError",
                recoverable: false,
                host_error: false,
            },
            TemplarError::Flow(_) => ErrorClassification {
                error_type: "FlowError",
                recoverable: false,
                host_error: false,
            },
            TemplarError::Cancelled(_) => ErrorClassification {
                error_type: "Cancelled",
                recoverable: false,
                host_error: false,
            },
            TemplarError::Yaml(_) => ErrorClassification {
                error_type: "YamlError",
                recoverable: false,
                host_error: false,
            },
            TemplarError::Internal(_) => ErrorClassification {
                error_type: "InternalError",
                recoverable: false,
                host_error: false,
            },
        }
    }

    pub fn is_host_skip(&self) -> bool {
        matches!(self, TemplarError::HostSkipped(_))
    }
}
