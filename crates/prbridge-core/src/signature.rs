//! Webhook signature verification
//!
//! GitHub signs each delivery with HMAC-SHA256 over the raw body
//! (`X-Hub-Signature-256: sha256=<hex>`). Slack signs
//! `v0:{timestamp}:{body}` (`X-Slack-Signature: v0=<hex>`) and stale
//! timestamps are rejected before the signature is even checked, so a
//! replayed request cannot pass with a once-valid signature.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a Slack request timestamp, in seconds.
pub const SLACK_TIMESTAMP_TOLERANCE_SECS: i64 = 300;

/// Verify a GitHub webhook signature.
///
/// The expected format is "sha256=<hex-encoded-hmac>". Any malformed
/// signature (missing prefix, invalid hex, wrong length) is a verification
/// failure, not an error.
pub fn verify_github_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    let signature = match signature.strip_prefix("sha256=") {
        Some(sig) => sig,
        None => {
            warn!("Signature doesn't start with 'sha256='");
            return false;
        }
    };

    let expected = match hex::decode(signature) {
        Ok(sig) => sig,
        Err(e) => {
            warn!(error = %e, "Failed to decode signature hex");
            return false;
        }
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "Failed to create HMAC");
            return false;
        }
    };
    mac.update(payload);

    // verify_slice is a constant-time comparison; a length mismatch is
    // reported the same way as a digest mismatch.
    mac.verify_slice(&expected).is_ok()
}

/// Compute the GitHub-style signature for a payload, prefix included.
pub fn github_signature(secret: &str, payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(payload);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Verify a Slack request signature.
///
/// The base string is "v0:{timestamp}:{body}" and the expected signature is
/// "v0=<hex>". Requests whose timestamp is more than
/// [`SLACK_TIMESTAMP_TOLERANCE_SECS`] behind `now` are rejected regardless
/// of the signature.
pub fn verify_slack_signature(
    signing_secret: &str,
    timestamp: &str,
    body: &[u8],
    signature: &str,
    now: DateTime<Utc>,
) -> bool {
    let ts: i64 = match timestamp.parse() {
        Ok(ts) => ts,
        Err(_) => {
            warn!("Invalid Slack request timestamp");
            return false;
        }
    };

    if now.timestamp() - ts > SLACK_TIMESTAMP_TOLERANCE_SECS {
        warn!(age_secs = now.timestamp() - ts, "Stale Slack request timestamp");
        return false;
    }

    let signature = match signature.strip_prefix("v0=") {
        Some(sig) => sig,
        None => {
            warn!("Signature doesn't start with 'v0='");
            return false;
        }
    };

    let expected = match hex::decode(signature) {
        Ok(sig) => sig,
        Err(e) => {
            warn!(error = %e, "Failed to decode signature hex");
            return false;
        }
    };

    let mut mac = match HmacSha256::new_from_slice(signing_secret.as_bytes()) {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "Failed to create HMAC");
            return false;
        }
    };
    mac.update(b"v0:");
    mac.update(timestamp.as_bytes());
    mac.update(b":");
    mac.update(body);

    mac.verify_slice(&expected).is_ok()
}

/// Compute the Slack-style signature for a timestamp/body pair.
pub fn slack_signature(signing_secret: &str, timestamp: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(signing_secret.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(b"v0:");
    mac.update(timestamp.as_bytes());
    mac.update(b":");
    mac.update(body);
    format!("v0={}", hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    // Fixed vector from GitHub's webhook documentation.
    const BODY: &[u8] = b"Hello, World!";
    const SECRET: &str = "It's a Secret to Everybody";
    const KNOWN_SIGNATURE: &str =
        "sha256=757107ea0eb2509fc211221cce984b8a37570b6d7586c22c46f4379c8b043e17";

    #[test]
    fn test_github_signature_known_vector() {
        assert_eq!(github_signature(SECRET, BODY), KNOWN_SIGNATURE);
        assert!(verify_github_signature(SECRET, BODY, KNOWN_SIGNATURE));
    }

    #[test]
    fn test_github_signature_rejects_mutated_body() {
        assert!(!verify_github_signature(SECRET, b"Hello, World?", KNOWN_SIGNATURE));
    }

    #[test]
    fn test_github_signature_rejects_mutated_secret() {
        assert!(!verify_github_signature("It's a secret to everybody", BODY, KNOWN_SIGNATURE));
    }

    #[test]
    fn test_github_signature_rejects_missing_prefix() {
        let bare = KNOWN_SIGNATURE.strip_prefix("sha256=").unwrap();
        assert!(!verify_github_signature(SECRET, BODY, bare));
    }

    #[test]
    fn test_github_signature_rejects_invalid_hex() {
        assert!(!verify_github_signature(SECRET, BODY, "sha256=not-hex"));
    }

    #[test]
    fn test_github_signature_rejects_truncated_signature() {
        // Length mismatch is a verification failure, not a panic.
        assert!(!verify_github_signature(SECRET, BODY, "sha256=757107ea"));
    }

    #[test]
    fn test_slack_signature_round_trip() {
        let now = Utc::now();
        let timestamp = now.timestamp().to_string();
        let body = b"token=xyz&command=%2Fprbridge";

        let sig = slack_signature("slack-secret", &timestamp, body);
        assert!(verify_slack_signature("slack-secret", &timestamp, body, &sig, now));
    }

    #[test]
    fn test_slack_signature_rejects_stale_timestamp() {
        let now = Utc::now();
        let stale = (now - Duration::seconds(301)).timestamp().to_string();
        let body = b"token=xyz";

        // Signature itself is valid; staleness alone must reject.
        let sig = slack_signature("slack-secret", &stale, body);
        assert!(!verify_slack_signature("slack-secret", &stale, body, &sig, now));
    }

    #[test]
    fn test_slack_signature_accepts_timestamp_at_tolerance() {
        let now = Utc::now();
        let edge = (now - Duration::seconds(299)).timestamp().to_string();
        let body = b"token=xyz";

        let sig = slack_signature("slack-secret", &edge, body);
        assert!(verify_slack_signature("slack-secret", &edge, body, &sig, now));
    }

    #[test]
    fn test_slack_signature_rejects_wrong_secret() {
        let now = Utc::now();
        let timestamp = now.timestamp().to_string();
        let body = b"token=xyz";

        let sig = slack_signature("slack-secret", &timestamp, body);
        assert!(!verify_slack_signature("other-secret", &timestamp, body, &sig, now));
    }

    #[test]
    fn test_slack_signature_rejects_garbage_timestamp() {
        assert!(!verify_slack_signature(
            "slack-secret",
            "not-a-number",
            b"body",
            "v0=00",
            Utc::now()
        ));
    }
}
