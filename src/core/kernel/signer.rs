use crate::core::errors::ExchangeError;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// A request whose parameters have been fixed and signed.
///
/// Constructed per call and consumed by the transport. The exchange rejects
/// replays through its timestamp / `recvWindow` check, so it is never cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedRequest {
    /// Parameters in the exact order they were signed, `timestamp` included.
    pub params: Vec<(String, String)>,
    /// Canonical `key=value&...` string the signature was computed over.
    pub query: String,
    /// Hex-encoded HMAC-SHA256 of `query`.
    pub signature: String,
}

impl SignedRequest {
    /// Parameters ready for the wire, with `signature` appended last.
    pub fn into_pairs(self) -> Vec<(String, String)> {
        let mut params = self.params;
        params.push(("signature".to_string(), self.signature));
        params
    }

    /// Wire-encoded form, identical to what was signed plus the signature.
    pub fn to_query_string(&self) -> String {
        if self.query.is_empty() {
            format!("signature={}", self.signature)
        } else {
            format!("{}&signature={}", self.query, self.signature)
        }
    }
}

/// Signer trait for request authentication
///
/// Implementations own the credentials. The transport asks for the API-key
/// header on every call and for a signature only on signed calls.
pub trait Signer: Send + Sync {
    /// Header name and value identifying the caller.
    fn api_key_header(&self) -> (&'static str, String);

    /// Sign `params` (in insertion order) after appending the extra fields the
    /// exchange expects on signed calls.
    fn sign_request(
        &self,
        params: &[(String, String)],
        timestamp: u64,
        recv_window: Option<u64>,
    ) -> Result<SignedRequest, ExchangeError>;
}

/// Join parameters into `key=value` pairs separated by `&`, preserving order.
pub fn canonical_query(params: &[(String, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// HMAC-SHA256 signer keyed by the account secret
pub struct HmacSigner {
    api_key: String,
    secret_key: String,
}

impl std::fmt::Debug for HmacSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacSigner").finish_non_exhaustive()
    }
}

impl HmacSigner {
    /// Create a new HMAC signer
    ///
    /// An empty secret is a fatal misconfiguration: nothing could ever be signed.
    pub fn new(api_key: String, secret_key: String) -> Result<Self, ExchangeError> {
        if secret_key.is_empty() {
            return Err(ExchangeError::ConfigurationError(
                "API secret is required for signing".to_string(),
            ));
        }
        Ok(Self {
            api_key,
            secret_key,
        })
    }

    /// Hex digest of the canonical query built from `params`.
    pub fn sign(&self, params: &[(String, String)]) -> Result<String, ExchangeError> {
        self.sign_payload(&canonical_query(params))
    }

    fn sign_payload(&self, payload: &str) -> Result<String, ExchangeError> {
        let mut mac = HmacSha256::new_from_slice(self.secret_key.as_bytes())
            .map_err(|e| ExchangeError::AuthError(format!("Invalid secret key: {}", e)))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

impl Signer for HmacSigner {
    fn api_key_header(&self) -> (&'static str, String) {
        ("X-MBX-APIKEY", self.api_key.clone())
    }

    fn sign_request(
        &self,
        params: &[(String, String)],
        timestamp: u64,
        recv_window: Option<u64>,
    ) -> Result<SignedRequest, ExchangeError> {
        let mut params = params.to_vec();
        if let Some(recv_window) = recv_window {
            params.push(("recvWindow".to_string(), recv_window.to_string()));
        }
        params.push(("timestamp".to_string(), timestamp.to_string()));

        let query = canonical_query(&params);
        let signature = self.sign_payload(&query)?;

        Ok(SignedRequest {
            params,
            query,
            signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(raw: &[(&str, &str)]) -> Vec<(String, String)> {
        raw.iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn signer() -> HmacSigner {
        HmacSigner::new(
            "vmPUZE6mv9SD5VNHk4HlWFsOr6aKE2zvsw0MuIgwCIPy6utIco14y7Ju91duEh8A".to_string(),
            "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j".to_string(),
        )
        .unwrap()
    }

    #[test]
    fn test_known_vector() {
        // Reference example from the exchange's API documentation.
        let params = pairs(&[
            ("symbol", "LTCBTC"),
            ("side", "BUY"),
            ("type", "LIMIT"),
            ("timeInForce", "GTC"),
            ("quantity", "1"),
            ("price", "0.1"),
            ("recvWindow", "5000"),
            ("timestamp", "1499827319559"),
        ]);
        assert_eq!(
            signer().sign(&params).unwrap(),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn test_deterministic() {
        let params = pairs(&[("symbol", "BTCUSDT"), ("quantity", "0.002")]);
        let s = signer();
        assert_eq!(s.sign(&params).unwrap(), s.sign(&params).unwrap());
    }

    #[test]
    fn test_order_and_value_sensitive() {
        let s = signer();
        let base = s
            .sign(&pairs(&[("symbol", "BTCUSDT"), ("side", "BUY")]))
            .unwrap();
        let reordered = s
            .sign(&pairs(&[("side", "BUY"), ("symbol", "BTCUSDT")]))
            .unwrap();
        let changed = s
            .sign(&pairs(&[("symbol", "BTCUSDT"), ("side", "SELL")]))
            .unwrap();
        assert_ne!(base, reordered);
        assert_ne!(base, changed);
    }

    #[test]
    fn test_sign_request_appends_timestamp_and_signature_last() {
        let signed = signer()
            .sign_request(&pairs(&[("symbol", "BTCUSDT")]), 1_700_000_000_000, Some(5000))
            .unwrap();
        assert_eq!(
            signed.query,
            "symbol=BTCUSDT&recvWindow=5000&timestamp=1700000000000"
        );
        let wire = signed.clone().into_pairs();
        assert_eq!(wire.last().unwrap().0, "signature");
        assert_eq!(wire.last().unwrap().1, signed.signature);
        assert!(signed
            .to_query_string()
            .ends_with(&format!("&signature={}", signed.signature)));
    }

    #[test]
    fn test_missing_secret_is_fatal() {
        assert!(matches!(
            HmacSigner::new("key".to_string(), String::new()),
            Err(ExchangeError::ConfigurationError(_))
        ));
    }
}
