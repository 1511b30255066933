use std::str::Utf8Error;

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha1::Sha1;

/// Header carrying `sha1=<hex digest>` of the raw body.
pub const SIGNATURE_HEADER: &str = "X-Hub-Signature";
/// Header naming the event kind (`push`, `ping`, ...).
pub const EVENT_HEADER: &str = "X-GitHub-Event";
/// Header carrying the unique delivery ID.
pub const DELIVERY_HEADER: &str = "X-GitHub-Delivery";

const SIGNATURE_PREFIX: &str = "sha1=";

type HmacSha1 = Hmac<Sha1>;

fn mac(secret: &[u8], body: &[u8]) -> HmacSha1 {
    let mut mac = HmacSha1::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(body);
    mac
}

/// Compute the signature header value for `body`.
pub fn sign(secret: &[u8], body: &[u8]) -> String {
    format!("{SIGNATURE_PREFIX}{}", hex::encode(mac(secret, body).finalize().into_bytes()))
}

/// Check a presented signature header against `body`.
///
/// Returns true iff `signature` is exactly `sha1=` followed by the lowercase hex
/// HMAC-SHA1 of `body` keyed with `secret`. A missing header is a mismatch.
/// The digest comparison runs in constant time; only the shape of the presented
/// value (prefix, alphabet, length) is checked with early exits, and none of
/// that depends on the secret.
pub fn verify(secret: &[u8], body: &[u8], signature: Option<&str>) -> bool {
    let Some(digest) = signature.and_then(|s| s.strip_prefix(SIGNATURE_PREFIX)) else {
        return false;
    };
    if !digest.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return false;
    }
    let Ok(digest) = hex::decode(digest) else {
        return false;
    };
    mac(secret, body).verify_slice(&digest).is_ok()
}

/// The part of a push notification this service acts on.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
pub struct PushEvent {
    #[serde(rename = "ref")]
    pub git_ref: String,
}

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("push payload is not valid UTF-8: {0}")]
    Utf8(#[from] Utf8Error),
    #[error("malformed push payload: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn parse_push(body: &[u8]) -> Result<PushEvent, PayloadError> {
    let text = std::str::from_utf8(body)?;
    Ok(serde_json::from_str(text)?)
}
