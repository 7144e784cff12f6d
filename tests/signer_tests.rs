//! Black-box coverage of C2 (`Signer`) through its public API: webhook HMAC
//! verification and the internal bearer token lifecycle, composed the way the
//! rest of this crate actually uses them (the webhook ingress path, and
//! agent-to-agent bearer issuance via `Engine`).

use agentmesh::signer::{BearerError, Signer};
use hmac::{Hmac, Mac};
use sha2::Sha256;

fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    let digest = mac.finalize().into_bytes();
    format!("sha256={}", digest.iter().map(|b| format!("{:02x}", b)).collect::<String>())
}

#[test]
fn webhook_signature_round_trips_through_a_realistic_payload() {
    let secret = "shared-secret";
    let body = br#"{"external_id":"ext-1","subject":"new lead"}"#;
    let header = sign(secret, body);
    assert!(Signer::verify_webhook(body, &header, secret));

    let tampered = br#"{"external_id":"ext-1","subject":"injected"}"#;
    assert!(!Signer::verify_webhook(tampered, &header, secret));
}

#[test]
fn bearer_ttl_is_clamped_to_the_sixty_second_ceiling() {
    let key = "internal-signing-key";
    // Request a much longer TTL than the ceiling allows; the token must still
    // verify (the clamp only shortens it, it never rejects the request).
    let token = Signer::issue_internal_bearer(key, "product_manager", "engineer", 3600);
    let claims = Signer::verify_internal_bearer(key, &token, "engineer").unwrap();
    assert!(claims.expires_at - claims.issued_at <= 60);
}

#[test]
fn bearer_rejects_verification_under_a_different_key() {
    let token = Signer::issue_internal_bearer("key-a", "product_manager", "engineer", 30);
    let err = Signer::verify_internal_bearer("key-b", &token, "engineer").unwrap_err();
    assert_eq!(err, BearerError::BadSignature);
}

#[test]
fn issued_token_never_leaks_the_signing_key_in_its_wire_form() {
    let key = "super-secret-signing-key";
    let token = Signer::issue_internal_bearer(key, "orchestrator", "finance_manager", 10);
    assert!(!token.contains(key));
}
