use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Invalid signal '{signal_id}' ({expr}): {reason}")]
    SignalConfiguration {
        signal_id: String,
        expr: String,
        reason: String,
    },

    #[error("Leakage in signal '{signal_id}': {reason}")]
    Leakage { signal_id: String, reason: String },

    #[error("Split {index} failed: {reason}")]
    SplitComputation { index: usize, reason: String },

    #[error("Invalid panel: {message}")]
    Data { message: String },
}

impl EngineError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn data(message: impl Into<String>) -> Self {
        Self::Data {
            message: message.into(),
        }
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::EngineError;

    #[test]
    fn messages_name_the_offending_signal() {
        let err = EngineError::SignalConfiguration {
            signal_id: "mom".to_string(),
            expr: "FOO(1)".to_string(),
            reason: "unknown primitive FOO".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("mom"));
        assert!(text.contains("FOO(1)"));
    }
}
