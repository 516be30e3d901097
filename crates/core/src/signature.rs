use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Maximum accepted age of a signed request, in seconds.
pub const DEFAULT_MAX_AGE_SECS: i64 = 300;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature header is empty")]
    EmptyHeader,
    #[error("signature header is missing the `{0}` field")]
    MissingField(&'static str),
    #[error("signature header has a non-numeric timestamp: `{0}`")]
    InvalidTimestamp(String),
}

/// Produce a header that [`verify`] accepts for the same body and secret.
///
/// When `timestamp` is `None` the current unix time is used. Primarily for
/// tests and for signing callbacks we originate ourselves.
pub fn generate(body: &[u8], secret: &str, timestamp: Option<i64>) -> String {
    let timestamp = timestamp.unwrap_or_else(|| Utc::now().timestamp());
    let signature = hmac_hex(secret.as_bytes(), timestamp, body);
    format!("timestamp={timestamp},signature={signature}")
}

/// Validate a webhook signature header against the raw request body.
///
/// The header format is `timestamp=<unix_seconds>,signature=<hex>`. A header
/// that cannot be parsed is an error; a header that parses but does not match
/// (wrong secret, tampered body, outside the replay window) is `Ok(false)`.
pub fn verify(
    body: &[u8],
    header: &str,
    secret: &str,
    max_age_secs: i64,
) -> Result<bool, SignatureError> {
    verify_at(body, header, secret, max_age_secs, Utc::now().timestamp())
}

/// Same as [`verify`] with an explicit clock, so replay-window boundaries are
/// testable without sleeping.
pub fn verify_at(
    body: &[u8],
    header: &str,
    secret: &str,
    max_age_secs: i64,
    now: i64,
) -> Result<bool, SignatureError> {
    let parsed = parse_header(header)?;

    // Replay window and cryptographic check both fail closed; the window
    // check is not short-circuited on parse success alone.
    let fresh = (now - parsed.timestamp).abs() <= max_age_secs;

    let Some(claimed) = decode_hex(&parsed.signature) else {
        return Ok(false);
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return Ok(false);
    };
    mac.update(parsed.timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);

    // Mac::verify_slice is a constant-time comparison.
    let authentic = mac.verify_slice(&claimed).is_ok();

    Ok(fresh && authentic)
}

struct ParsedHeader {
    timestamp: i64,
    signature: String,
}

fn parse_header(header: &str) -> Result<ParsedHeader, SignatureError> {
    if header.trim().is_empty() {
        return Err(SignatureError::EmptyHeader);
    }

    let mut timestamp = None;
    let mut signature = None;
    for part in header.split(',') {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        match key.trim() {
            "timestamp" => {
                let raw = value.trim();
                timestamp = Some(raw.parse::<i64>().map_err(|_| {
                    SignatureError::InvalidTimestamp(raw.to_string())
                })?);
            }
            "signature" => signature = Some(value.trim().to_string()),
            _ => {}
        }
    }

    Ok(ParsedHeader {
        timestamp: timestamp.ok_or(SignatureError::MissingField("timestamp"))?,
        signature: signature.ok_or(SignatureError::MissingField("signature"))?,
    })
}

fn hmac_hex(secret: &[u8], timestamp: i64, body: &[u8]) -> String {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return String::new();
    };
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    encode_hex(mac.finalize().into_bytes().as_slice())
}

fn encode_hex(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

fn decode_hex(input: &str) -> Option<Vec<u8>> {
    if input.len() % 2 != 0 {
        return None;
    }
    (0..input.len())
        .step_by(2)
        .map(|index| u8::from_str_radix(input.get(index..index + 2)?, 16).ok())
        .collect()
}
