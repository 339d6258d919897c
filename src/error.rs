use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// The five-way classification every stage matches on (§7). Concrete error
/// variants carry their own context; `classify()` maps them onto this set so
/// a stage never needs to match on which library produced the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    InvalidInput,
    NotFound,
    Transient,
    Permanent,
    Fatal,
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("config error: {0}")]
    ConfigError(String),

    #[error("config not found: {0}")]
    ConfigNotFound(String),

    #[error("record not found: {0}")]
    RecordNotFound(String),

    #[error("dlq does not exist: {0}")]
    DlqNotExists(String),

    #[error("no messages in dlq: {0}")]
    NoMessagesInDlq(String),

    #[error("dlq batch size {requested} exceeds max {max}")]
    DlqMaxBatchSizeExceeded { requested: i64, max: usize },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("coercion error: field {field} value {value} ({observed_type}): {reason}")]
    Coercion {
        field: String,
        value: String,
        observed_type: &'static str,
        reason: String,
    },

    #[error("out of range: field {field} value {value} for type {target_type}")]
    OutOfRange {
        field: String,
        value: String,
        target_type: &'static str,
    },

    #[error("clickhouse error: {0}")]
    ClickHouse(#[from] clickhouse::error::Error),

    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("stream log error: {0}")]
    StreamLog(String),

    #[error("stream log connect error: {0}")]
    StreamLogConnect(#[from] async_nats::ConnectError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transient error: {0}")]
    Transient(String),

    #[error("permanent error: {0}")]
    Permanent(String),

    #[error("fatal error: {0}")]
    Fatal(String),
}

impl PipelineError {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        PipelineError::ConfigError(msg.into())
    }

    pub fn config_not_found<S: Into<String>>(msg: S) -> Self {
        PipelineError::ConfigNotFound(msg.into())
    }

    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        PipelineError::InvalidInput(msg.into())
    }

    pub fn transient<S: Into<String>>(msg: S) -> Self {
        PipelineError::Transient(msg.into())
    }

    pub fn permanent<S: Into<String>>(msg: S) -> Self {
        PipelineError::Permanent(msg.into())
    }

    pub fn fatal<S: Into<String>>(msg: S) -> Self {
        PipelineError::Fatal(msg.into())
    }

    pub fn stream_log<S: Into<String>>(msg: S) -> Self {
        PipelineError::StreamLog(msg.into())
    }

    /// Wrap with an operation name, preserving the causal chain (§7: "every
    /// error surfaced externally is wrapped with the operation name").
    pub fn wrap(self, op: &str) -> Self {
        match self {
            PipelineError::Fatal(m) => PipelineError::Fatal(format!("{op}: {m}")),
            PipelineError::Transient(m) => PipelineError::Transient(format!("{op}: {m}")),
            PipelineError::Permanent(m) => PipelineError::Permanent(format!("{op}: {m}")),
            PipelineError::StreamLog(m) => PipelineError::StreamLog(format!("{op}: {m}")),
            other => PipelineError::Permanent(format!("{op}: {other}")),
        }
    }

    pub fn classify(&self) -> ErrorClass {
        match self {
            PipelineError::InvalidInput(_) | PipelineError::DlqMaxBatchSizeExceeded { .. } => {
                ErrorClass::InvalidInput
            }
            PipelineError::ConfigNotFound(_)
            | PipelineError::RecordNotFound(_)
            | PipelineError::DlqNotExists(_)
            | PipelineError::NoMessagesInDlq(_) => ErrorClass::NotFound,
            PipelineError::Transient(_) => ErrorClass::Transient,
            PipelineError::Coercion { .. } | PipelineError::OutOfRange { .. } => {
                ErrorClass::Permanent
            }
            PipelineError::Permanent(_) => ErrorClass::Permanent,
            PipelineError::Fatal(_) | PipelineError::ConfigError(_) => ErrorClass::Fatal,
            PipelineError::ClickHouse(e) => classify_clickhouse(e),
            PipelineError::Kafka(_) => ErrorClass::Transient,
            PipelineError::StreamLog(_) | PipelineError::StreamLogConnect(_) => {
                ErrorClass::Transient
            }
            PipelineError::Serialization(_) | PipelineError::Yaml(_) => ErrorClass::Permanent,
            PipelineError::Io(_) => ErrorClass::Transient,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.classify() == ErrorClass::Transient
    }

    pub fn is_fatal(&self) -> bool {
        self.classify() == ErrorClass::Fatal
    }
}

fn classify_clickhouse(e: &clickhouse::error::Error) -> ErrorClass {
    let msg = e.to_string();
    if msg.contains("timeout") || msg.contains("Timeout") || msg.contains("connection") {
        ErrorClass::Transient
    } else {
        ErrorClass::Permanent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_invalid_input() {
        let e = PipelineError::invalid_input("batch size must be positive");
        assert_eq!(e.classify(), ErrorClass::InvalidInput);
    }

    #[test]
    fn classifies_not_found_variants() {
        assert_eq!(
            PipelineError::DlqNotExists("p1.DLQ".into()).classify(),
            ErrorClass::NotFound
        );
        assert_eq!(
            PipelineError::NoMessagesInDlq("p1.DLQ".into()).classify(),
            ErrorClass::NotFound
        );
    }

    #[test]
    fn wrap_preserves_message_and_adds_operation() {
        let e = PipelineError::transient("connection reset").wrap("fetch dlq message batch");
        assert!(e.to_string().contains("fetch dlq message batch"));
        assert!(e.to_string().contains("connection reset"));
    }
}
