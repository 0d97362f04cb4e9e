use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey};
use serde_json::Value;
use uuid::Uuid;

/// Headers carried on every signed private request, per §4.1/§6.
#[derive(Debug, Clone)]
pub struct SignedRequestHeaders {
    pub sign_version: &'static str,
    pub request_id: String,
    pub timestamp_ms: String,
    pub signature_b64: String,
}

/// Holds the already-issued bearer JWT and Ed25519 signing key for the
/// session. Obtaining these (the wallet-signature prepare-signin/login
/// handshake) is an out-of-scope external collaborator per the spec; this
/// type only consumes their output.
pub struct AuthHandle {
    bearer_token: String,
    signing_key: SigningKey,
}

impl AuthHandle {
    pub fn new(bearer_token: String, signing_key: SigningKey) -> Self {
        AuthHandle {
            bearer_token,
            signing_key,
        }
    }

    pub fn authorization_header(&self) -> String {
        format!("Bearer {}", self.bearer_token)
    }

    /// Signs `body` and returns the `x-request-*` headers. The canonical
    /// bytes produced here (`canonical_json`) are exactly the bytes that
    /// must be transmitted as the HTTP body — callers send `canonical_json(body)`
    /// verbatim, never re-serialize after signing.
    pub fn sign_request(&self, body: &Value) -> SignedRequestHeaders {
        let version = "v1";
        let request_id = Uuid::new_v4().to_string();
        let timestamp_ms = chrono::Utc::now().timestamp_millis().to_string();
        let canonical_body = canonical_json(body);

        let message = format!("{version},{request_id},{timestamp_ms},{canonical_body}");
        let signature: Signature = self.signing_key.sign(message.as_bytes());
        let signature_b64 = base64::engine::general_purpose::STANDARD.encode(signature.to_bytes());

        SignedRequestHeaders {
            sign_version: version,
            request_id,
            timestamp_ms,
            signature_b64,
        }
    }
}

/// Sorted-key, separator-minimal JSON serialization. `serde_json`'s
/// `preserve_order` feature keeps object insertion order on the way in;
/// this function re-sorts object keys lexicographically so the signed
/// bytes are deterministic regardless of how `body` was constructed.
pub fn canonical_json(value: &Value) -> String {
    let sorted = sort_keys(value);
    serde_json::to_string(&sorted).expect("canonical JSON values are always serializable")
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut sorted = serde_json::Map::new();
            for (k, v) in entries {
                sorted.insert(k.clone(), sort_keys(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    #[test]
    fn canonical_json_sorts_keys_and_strips_whitespace() {
        let value = serde_json::json!({"b": 1, "a": {"d": 2, "c": 3}});
        assert_eq!(canonical_json(&value), r#"{"a":{"c":3,"d":2},"b":1}"#);
    }

    #[test]
    fn sign_request_headers_are_well_formed() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let auth = AuthHandle::new("jwt-token".to_string(), signing_key);
        let body = serde_json::json!({"symbol": "BTC-USD", "price": 50000});
        let headers = auth.sign_request(&body);

        assert_eq!(headers.sign_version, "v1");
        assert!(!headers.request_id.is_empty());
        assert!(!headers.signature_b64.is_empty());
        assert!(headers.timestamp_ms.parse::<i64>().unwrap() > 0);
    }

    #[test]
    fn signature_verifies_over_exact_signed_bytes() {
        use ed25519_dalek::Verifier;

        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        let auth = AuthHandle::new("jwt-token".to_string(), signing_key);
        let body = serde_json::json!({"z": 1, "a": 2});
        let headers = auth.sign_request(&body);

        let canonical_body = canonical_json(&body);
        let message = format!(
            "{},{},{},{}",
            headers.sign_version, headers.request_id, headers.timestamp_ms, canonical_body
        );
        let sig_bytes = base64::engine::general_purpose::STANDARD
            .decode(headers.signature_b64)
            .unwrap();
        let signature = Signature::from_slice(&sig_bytes).unwrap();
        assert!(verifying_key.verify(message.as_bytes(), &signature).is_ok());
    }
}
