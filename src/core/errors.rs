use crate::core::types::StreamKind;
use thiserror::Error;

/// Exchange error code for "This listenKey does not exist."
pub const INVALID_LISTEN_KEY_CODE: i64 = -1125;

#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("API error: status={status} code={code} - {message}")]
    ApiError {
        status: u16,
        code: i64,
        message: String,
    },

    #[error("Authentication error: {0}")]
    AuthError(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Connection timeout: {0}")]
    ConnectionTimeout(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] crate::core::config::ConfigError),

    #[error("Max retries for {kind} listen key generation exceeded after {attempts} attempts")]
    TokenAcquisitionExhausted { kind: StreamKind, attempts: u32 },

    #[error("Failed to reconnect after {attempts} attempts.")]
    ReconnectExhausted { attempts: u32 },

    #[error("Session terminated: {0}")]
    SessionTerminated(String),

    #[error("Already subscribed: {0}")]
    AlreadySubscribed(String),

    #[error("Other error: {0}")]
    Other(String),
}

impl ExchangeError {
    /// Transport-level failure that never reached the exchange's business logic.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::NetworkError(_) | Self::ConnectionTimeout(_))
    }

    pub fn is_invalid_listen_key(&self) -> bool {
        matches!(self, Self::ApiError { code, .. } if *code == INVALID_LISTEN_KEY_CODE)
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::ConnectionTimeout(err.to_string())
        } else {
            Self::NetworkError(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_listen_key_detection() {
        let err = ExchangeError::ApiError {
            status: 400,
            code: -1125,
            message: "This listenKey does not exist.".to_string(),
        };
        assert!(err.is_invalid_listen_key());
        assert!(!err.is_transport());

        let other = ExchangeError::ApiError {
            status: 400,
            code: -2019,
            message: "Margin is insufficient.".to_string(),
        };
        assert!(!other.is_invalid_listen_key());
    }

    #[test]
    fn test_transport_classification() {
        assert!(ExchangeError::NetworkError("refused".to_string()).is_transport());
        assert!(ExchangeError::ConnectionTimeout("5000ms".to_string()).is_transport());
        assert!(!ExchangeError::Other("x".to_string()).is_transport());
    }

    #[test]
    fn test_reconnect_exhausted_message() {
        let err = ExchangeError::ReconnectExhausted { attempts: 2 };
        assert_eq!(err.to_string(), "Failed to reconnect after 2 attempts.");
    }
}
