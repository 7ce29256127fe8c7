use crate::core::errors::ExchangeError;
use crate::core::kernel::signer::{canonical_query, Signer};
use async_trait::async_trait;
use reqwest::{Client, Method, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{instrument, trace};

/// REST client trait for making HTTP requests
///
/// `request` is the single primitive every typed operation is built on.
/// Parameters are an ordered mapping: signed calls are signed over exactly
/// this order.
#[async_trait]
pub trait RestClient: Send + Sync {
    /// Issue a request and return the decoded JSON body
    ///
    /// # Arguments
    /// * `method` - HTTP method
    /// * `endpoint` - API endpoint path, appended to the base URL
    /// * `params` - Ordered request parameters
    /// * `signed` - Whether to add `timestamp` and `signature`
    ///
    /// # Errors
    /// Transport failures surface as `NetworkError` / `ConnectionTimeout`;
    /// exchange rejections as `ApiError`.
    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        params: &[(String, String)],
        signed: bool,
    ) -> Result<Value, ExchangeError>;
}

/// Deserialize a response body into a typed value
pub fn decode<T: DeserializeOwned>(value: Value) -> Result<T, ExchangeError> {
    serde_json::from_value(value)
        .map_err(|e| ExchangeError::DeserializationError(format!("Failed to deserialize JSON: {}", e)))
}

/// Classify a raw HTTP response
///
/// Non-2xx statuses and 2xx bodies carrying a negative exchange `code` are
/// both exchange rejections.
pub fn parse_response(status: u16, body: &str) -> Result<Value, ExchangeError> {
    let parsed: Option<Value> = if body.trim().is_empty() {
        Some(Value::Null)
    } else {
        serde_json::from_str(body).ok()
    };

    let coded_error = parsed.as_ref().and_then(|value| {
        let code = value.get("code").and_then(Value::as_i64)?;
        let message = value
            .get("msg")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Some((code, message))
    });

    if (200..300).contains(&status) {
        if let Some((code, message)) = coded_error.filter(|(code, _)| *code < 0) {
            return Err(ExchangeError::ApiError {
                status,
                code,
                message,
            });
        }
        return parsed.ok_or_else(|| {
            ExchangeError::DeserializationError(format!("Failed to parse JSON response: {}", body))
        });
    }

    let (code, message) = coded_error.unwrap_or_else(|| (i64::from(status), body.to_string()));
    Err(ExchangeError::ApiError {
        status,
        code,
        message,
    })
}

/// Configuration for the REST client
#[derive(Clone, Debug)]
pub struct RestClientConfig {
    /// Base URL for the API
    pub base_url: String,
    /// Exchange name for logging and tracing
    pub exchange_name: String,
    /// Per-request timeout in milliseconds
    pub timeout_ms: u64,
    /// `recvWindow` appended to signed requests
    pub recv_window: Option<u64>,
    /// User agent string to include in requests
    pub user_agent: String,
}

impl RestClientConfig {
    /// Create a new configuration
    ///
    /// The timeout defaults to the exchange's 5000ms receive window.
    pub fn new(base_url: String, exchange_name: String) -> Self {
        Self {
            base_url,
            exchange_name,
            timeout_ms: 5_000,
            recv_window: None,
            user_agent: "perpbot/0.1".to_string(),
        }
    }

    /// Set the request timeout
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Send `recvWindow` on signed calls and derive the timeout from it
    pub fn with_recv_window(mut self, recv_window: u64) -> Self {
        self.recv_window = Some(recv_window);
        self.timeout_ms = recv_window;
        self
    }

    /// Set the user agent string
    pub fn with_user_agent(mut self, user_agent: String) -> Self {
        self.user_agent = user_agent;
        self
    }
}

/// Builder for creating REST client instances
pub struct RestClientBuilder {
    config: RestClientConfig,
    signer: Option<Arc<dyn Signer>>,
}

impl RestClientBuilder {
    pub fn new(config: RestClientConfig) -> Self {
        Self {
            config,
            signer: None,
        }
    }

    /// Set the signer for authenticated requests
    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Build the REST client
    pub fn build(self) -> Result<ReqwestRest, ExchangeError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(self.config.timeout_ms))
            .user_agent(&self.config.user_agent)
            .build()
            .map_err(|e| {
                ExchangeError::ConfigurationError(format!("Failed to build HTTP client: {}", e))
            })?;

        Ok(ReqwestRest {
            client,
            config: self.config,
            signer: self.signer,
        })
    }
}

/// Implementation of `RestClient` using reqwest
#[derive(Clone)]
pub struct ReqwestRest {
    client: Client,
    config: RestClientConfig,
    signer: Option<Arc<dyn Signer>>,
}

impl std::fmt::Debug for ReqwestRest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestRest")
            .field("config", &self.config)
            .field("has_signer", &self.signer.is_some())
            .finish_non_exhaustive()
    }
}

impl ReqwestRest {
    pub fn config(&self) -> &RestClientConfig {
        &self.config
    }

    fn timestamp() -> u64 {
        chrono::Utc::now().timestamp_millis().unsigned_abs()
    }

    /// Encode the parameters for the wire, signing them when required
    fn encode_params(
        &self,
        params: &[(String, String)],
        signed: bool,
    ) -> Result<String, ExchangeError> {
        if !signed {
            return Ok(canonical_query(params));
        }

        let signer = self.signer.as_ref().ok_or_else(|| {
            ExchangeError::AuthError("Authentication required but no signer provided".to_string())
        })?;
        let signed_request =
            signer.sign_request(params, Self::timestamp(), self.config.recv_window)?;
        Ok(signed_request.to_query_string())
    }

    #[instrument(skip(self, response), fields(exchange = %self.config.exchange_name, status = %response.status()))]
    async fn handle_response(&self, response: Response) -> Result<Value, ExchangeError> {
        let status = response.status().as_u16();
        let response_text = response.text().await.map_err(|e| {
            ExchangeError::NetworkError(format!("Failed to read response body: {}", e))
        })?;

        trace!("Response body: {}", response_text);
        parse_response(status, &response_text)
    }
}

#[async_trait]
impl RestClient for ReqwestRest {
    #[instrument(skip(self, params), fields(exchange = %self.config.exchange_name, method = %method, endpoint = %endpoint, signed = signed))]
    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        params: &[(String, String)],
        signed: bool,
    ) -> Result<Value, ExchangeError> {
        let encoded = self.encode_params(params, signed)?;
        let url = format!("{}{}", self.config.base_url, endpoint);

        // Query string for GET/DELETE, form body for POST/PUT
        let carries_body = method == Method::POST || method == Method::PUT;
        let mut request = if carries_body || encoded.is_empty() {
            self.client.request(method.clone(), &url)
        } else {
            self.client
                .request(method.clone(), format!("{}?{}", url, encoded))
        };

        if let Some(signer) = &self.signer {
            let (name, value) = signer.api_key_header();
            request = request.header(name, value);
        }

        if carries_body {
            request = request
                .header("Content-Type", "application/x-www-form-urlencoded")
                .body(encoded);
        }

        let response = request.send().await.map_err(ExchangeError::from)?;
        self.handle_response(response).await
    }
}
