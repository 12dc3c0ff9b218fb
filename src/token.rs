//! Legacy shared-access token generation.
//!
//! Devices without provisioning credentials authenticate to the hub with a
//! SharedAccessSignature derived from a symmetric device key: HMAC-SHA256
//! over the URL-encoded resource URI and expiry, with the base64-decoded
//! key as the secret.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("device key is not valid base64: {0}")]
    InvalidKey(#[from] base64::DecodeError),

    #[error("device key is empty")]
    EmptyKey,
}

#[derive(Clone, Debug)]
pub struct TokenConfig {
    /// Hub hostname; lowercased when building the resource URI.
    pub host: String,
    pub device_id: String,
    /// Base64-encoded symmetric device key.
    pub device_key_base64: String,
    /// Token validity window in seconds.
    pub expiry_seconds: u64,
}

/// Generates a SAS token valid until `now_unix + expiry_seconds`.
pub fn generate(config: &TokenConfig, now_unix: u64) -> Result<String, TokenError> {
    generate_at(config, now_unix + config.expiry_seconds)
}

/// Generates a SAS token with an explicit expiry timestamp.
pub fn generate_at(config: &TokenConfig, expiry_unix: u64) -> Result<String, TokenError> {
    if config.device_key_base64.is_empty() {
        return Err(TokenError::EmptyKey);
    }

    let resource_uri = format!("{}/devices/{}", config.host.to_lowercase(), config.device_id);
    let string_to_sign = format!("{}\n{expiry_unix}", url_encode(&resource_uri));

    let key = BASE64.decode(&config.device_key_base64)?;
    // key length is unconstrained for HMAC, so this cannot fail with a
    // non-empty decoded key
    let mut mac =
        HmacSha256::new_from_slice(&key).map_err(|_| TokenError::EmptyKey)?;
    mac.update(string_to_sign.as_bytes());
    let signature = BASE64.encode(mac.finalize().into_bytes());

    Ok(format!(
        "SharedAccessSignature sr={}&sig={}&se={expiry_unix}",
        url_encode(&resource_uri),
        url_encode(&signature)
    ))
}

/// Percent-encodes everything but RFC 3986 unreserved characters, with
/// uppercase hex digits.
fn url_encode(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char);
            }
            _ => {
                encoded.push('%');
                encoded.push_str(&format!("{byte:02X}"));
            }
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TokenConfig {
        TokenConfig {
            host: "Example-Hub.azure-devices.net".into(),
            device_id: "SIM-001".into(),
            device_key_base64: BASE64.encode(b"super secret device key"),
            expiry_seconds: 3600,
        }
    }

    #[test]
    fn token_has_the_expected_shape() {
        let token = generate_at(&config(), 1_700_000_000).unwrap();

        assert!(token.starts_with("SharedAccessSignature sr="));
        assert!(token.contains("&sig="));
        assert!(token.ends_with("&se=1700000000"));
        // hostname lowercased, slash percent-encoded
        assert!(token.contains("example-hub.azure-devices.net%2Fdevices%2FSIM-001"));
    }

    #[test]
    fn token_is_deterministic_for_fixed_expiry() {
        let a = generate_at(&config(), 1_700_000_000).unwrap();
        let b = generate_at(&config(), 1_700_000_000).unwrap();
        assert_eq!(a, b);

        let later = generate_at(&config(), 1_700_000_001).unwrap();
        assert_ne!(a, later);
    }

    #[test]
    fn expiry_window_is_added_to_now() {
        let token = generate(&config(), 1_000).unwrap();
        assert!(token.ends_with("&se=4600"));
    }

    #[test]
    fn rejects_bad_keys() {
        let mut bad = config();
        bad.device_key_base64 = "not base64!!!".into();
        assert!(matches!(
            generate_at(&bad, 1),
            Err(TokenError::InvalidKey(_))
        ));

        bad.device_key_base64 = String::new();
        assert!(matches!(generate_at(&bad, 1), Err(TokenError::EmptyKey)));
    }

    #[test]
    fn url_encoding_preserves_unreserved_characters() {
        assert_eq!(url_encode("AZaz09-_.~"), "AZaz09-_.~");
        assert_eq!(url_encode("a/b c+d"), "a%2Fb%20c%2Bd");
    }
}
