//! C2 — `Signer`: webhook HMAC verification and short-lived internal bearer tokens.
//!
//! Constant-time comparison follows the donor crate's own pattern in its MCP
//! server auth utility: hash both sides with `Sha256` and compare the digests with
//! `subtle::ConstantTimeEq`, rather than comparing raw bytes, so the optimizer
//! cannot introduce an early-exit short-circuit.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

const CLOCK_SKEW_TOLERANCE_SECS: i64 = 5;
const MAX_BEARER_TTL_SECS: i64 = 60;

/// Reasons an internal bearer token fails verification (§4.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BearerError {
    Expired,
    BadAudience,
    BadSignature,
}

impl std::fmt::Display for BearerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BearerError::Expired => write!(f, "bearer token expired"),
            BearerError::BadAudience => write!(f, "bearer token audience mismatch"),
            BearerError::BadSignature => write!(f, "bearer token signature invalid"),
        }
    }
}

impl std::error::Error for BearerError {}

/// Decoded claims from a verified internal bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerClaims {
    pub issuer: String,
    pub audience: String,
    pub issued_at: i64,
    pub expires_at: i64,
}

/// HMAC signing/verification for webhook deliveries and internal bearer tokens.
pub struct Signer;

impl Signer {
    /// Verify a `sha256=<hex>` webhook signature header against HMAC-SHA256 of
    /// the raw body, keyed by `secret`. Returns `false` (never an error) for a
    /// malformed, missing, or mismatched header — the caller maps that to 401.
    pub fn verify_webhook(body: &[u8], header: &str, secret: &str) -> bool {
        let hex_sig = match header.strip_prefix("sha256=") {
            Some(h) => h,
            None => return false,
        };
        let provided = match hex_decode(hex_sig) {
            Some(bytes) => bytes,
            None => return false,
        };

        let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
            Ok(m) => m,
            Err(_) => return false,
        };
        mac.update(body);
        let expected = mac.finalize().into_bytes();

        // Hash both sides before comparing so the comparison length is fixed
        // regardless of a malformed/short provided signature, mirroring the
        // donor's digest-then-compare idiom.
        let expected_hash = Sha256::digest(&expected);
        let provided_hash = Sha256::digest(&provided);
        expected_hash.ct_eq(&provided_hash).into()
    }

    /// Issue a short-lived (`ttl` clamped to ≤60s per §4.2) symmetric-keyed bearer
    /// token for an agent-to-agent call. The wire format is
    /// `base64url(issuer.audience.issued_at.expires_at).hex(hmac)` — compact and
    /// dependency-free (no JWT crate is justified for a single internal,
    /// non-standards-exchanged token shape).
    pub fn issue_internal_bearer(
        key: &str,
        issuer: &str,
        audience: &str,
        ttl_secs: i64,
    ) -> String {
        let ttl = ttl_secs.min(MAX_BEARER_TTL_SECS).max(0);
        let issued_at = now_unix();
        let expires_at = issued_at + ttl;
        let payload = format!("{}.{}.{}.{}", issuer, audience, issued_at, expires_at);
        let sig = hmac_hex(key, payload.as_bytes());
        format!("{}.{}", b64_encode(payload.as_bytes()), sig)
    }

    /// Verify a token minted by [`Signer::issue_internal_bearer`].
    pub fn verify_internal_bearer(
        key: &str,
        token: &str,
        expected_audience: &str,
    ) -> Result<BearerClaims, BearerError> {
        let (payload_b64, sig) = token
            .rsplit_once('.')
            .ok_or(BearerError::BadSignature)?;
        let payload_bytes = b64_decode(payload_b64).ok_or(BearerError::BadSignature)?;
        let payload = String::from_utf8(payload_bytes).map_err(|_| BearerError::BadSignature)?;

        let expected_sig = hmac_hex(key, payload.as_bytes());
        let expected_hash = Sha256::digest(expected_sig.as_bytes());
        let provided_hash = Sha256::digest(sig.as_bytes());
        if expected_hash.ct_eq(&provided_hash).unwrap_u8() == 0 {
            return Err(BearerError::BadSignature);
        }

        let mut parts = payload.splitn(4, '.');
        let issuer = parts.next().ok_or(BearerError::BadSignature)?.to_string();
        let audience = parts.next().ok_or(BearerError::BadSignature)?.to_string();
        let issued_at: i64 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or(BearerError::BadSignature)?;
        let expires_at: i64 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or(BearerError::BadSignature)?;

        if audience != expected_audience {
            return Err(BearerError::BadAudience);
        }

        let now = now_unix();
        if now > expires_at + CLOCK_SKEW_TOLERANCE_SECS {
            return Err(BearerError::Expired);
        }

        Ok(BearerClaims {
            issuer,
            audience,
            issued_at,
            expires_at,
        })
    }
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

fn hmac_hex(key: &str, data: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes()).expect("HMAC accepts any key length");
    mac.update(data);
    hex_encode(&mac.finalize().into_bytes())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

const B64_TABLE: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

fn b64_encode(data: &[u8]) -> String {
    let mut out = String::new();
    for chunk in data.chunks(3) {
        let b0 = chunk[0];
        let b1 = *chunk.get(1).unwrap_or(&0);
        let b2 = *chunk.get(2).unwrap_or(&0);
        out.push(B64_TABLE[(b0 >> 2) as usize] as char);
        out.push(B64_TABLE[(((b0 & 0x03) << 4) | (b1 >> 4)) as usize] as char);
        if chunk.len() > 1 {
            out.push(B64_TABLE[(((b1 & 0x0f) << 2) | (b2 >> 6)) as usize] as char);
        }
        if chunk.len() > 2 {
            out.push(B64_TABLE[(b2 & 0x3f) as usize] as char);
        }
    }
    out
}

fn b64_decode(s: &str) -> Option<Vec<u8>> {
    let mut table = [255u8; 256];
    for (i, &c) in B64_TABLE.iter().enumerate() {
        table[c as usize] = i as u8;
    }
    let mut out = Vec::new();
    let chars: Vec<u8> = s.bytes().collect();
    for chunk in chars.chunks(4) {
        if chunk.is_empty() {
            break;
        }
        let vals: Vec<u8> = chunk
            .iter()
            .map(|&c| table[c as usize])
            .collect();
        if vals.iter().any(|&v| v == 255) {
            return None;
        }
        out.push((vals[0] << 2) | (vals.get(1).copied().unwrap_or(0) >> 4));
        if vals.len() > 2 {
            out.push((vals[1] << 4) | (vals[2] >> 2));
        }
        if vals.len() > 3 {
            out.push((vals[2] << 6) | vals[3]);
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webhook_signature_round_trips() {
        let secret = "topsecret";
        let body = br#"{"external_id":"abc123"}"#;
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let sig = hex_encode(&mac.finalize().into_bytes());
        let header = format!("sha256={}", sig);
        assert!(Signer::verify_webhook(body, &header, secret));
    }

    #[test]
    fn webhook_signature_rejects_wrong_secret() {
        let body = b"payload";
        let header_for_other_secret = {
            let mut mac = HmacSha256::new_from_slice(b"other").unwrap();
            mac.update(body);
            format!("sha256={}", hex_encode(&mac.finalize().into_bytes()))
        };
        assert!(!Signer::verify_webhook(body, &header_for_other_secret, "topsecret"));
    }

    #[test]
    fn webhook_signature_rejects_malformed_header() {
        assert!(!Signer::verify_webhook(b"x", "not-a-signature", "secret"));
        assert!(!Signer::verify_webhook(b"x", "", "secret"));
        assert!(!Signer::verify_webhook(b"x", "sha256=zz", "secret"));
    }

    #[test]
    fn bearer_round_trips_within_ttl() {
        let key = "internal-key";
        let token = Signer::issue_internal_bearer(key, "orchestrator", "engineer", 30);
        let claims = Signer::verify_internal_bearer(key, &token, "engineer").unwrap();
        assert_eq!(claims.issuer, "orchestrator");
        assert_eq!(claims.audience, "engineer");
    }

    #[test]
    fn bearer_rejects_wrong_audience() {
        let key = "internal-key";
        let token = Signer::issue_internal_bearer(key, "orchestrator", "engineer", 30);
        let err = Signer::verify_internal_bearer(key, &token, "finance_manager").unwrap_err();
        assert_eq!(err, BearerError::BadAudience);
    }

    #[test]
    fn bearer_rejects_tampered_signature() {
        let key = "internal-key";
        let mut token = Signer::issue_internal_bearer(key, "orchestrator", "engineer", 30);
        token.push('x');
        let err = Signer::verify_internal_bearer(key, &token, "engineer").unwrap_err();
        assert_eq!(err, BearerError::BadSignature);
    }

    #[test]
    fn bearer_rejects_expired_token() {
        let key = "internal-key";
        let token = Signer::issue_internal_bearer(key, "orchestrator", "engineer", 0);
        // ttl=0 plus a skew tolerance means verification right away still passes;
        // simulate elapsed time by backdating via a hand-built expired payload.
        let payload = format!("{}.{}.{}.{}", "orchestrator", "engineer", 0, 0);
        let sig = hmac_hex(key, payload.as_bytes());
        let expired = format!("{}.{}", b64_encode(payload.as_bytes()), sig);
        let _ = token;
        let err = Signer::verify_internal_bearer(key, &expired, "engineer").unwrap_err();
        assert_eq!(err, BearerError::Expired);
    }
}
