//! Standard Webhooks symmetric signing.
//!
//! Secrets are base64 behind a `whsec_` prefix, 24 to 64 raw bytes. The
//! signed content is `{msgID}.{unixSeconds}.{payload}` and signatures render
//! as `v1,<base64(HMAC-SHA256)>`. The signature header carries a
//! space-separated list so receivers can rotate secrets.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::fmt;

type HmacSha256 = Hmac<Sha256>;

/// Prefix carried by every Standard Webhooks symmetric secret.
pub const SECRET_PREFIX: &str = "whsec_";

/// The only signature scheme supported.
pub const SIGNATURE_VERSION: &str = "v1";

/// Minimum secret size in raw bytes (192 bits).
pub const MIN_SECRET_BYTES: usize = 24;

/// Maximum secret size in raw bytes (512 bits).
pub const MAX_SECRET_BYTES: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error("secret must start with {SECRET_PREFIX} prefix")]
    MissingPrefix,

    #[error("decoding base64 secret: {0}")]
    SecretEncoding(#[from] base64::DecodeError),

    #[error("secret size must be between {MIN_SECRET_BYTES} and {MAX_SECRET_BYTES} bytes")]
    SecretSize,

    #[error("message ID must not contain '.'")]
    DottedMessageId,

    #[error("invalid signature format, expected 'version,signature'")]
    MalformedSignature,

    #[error("unsupported signature version: {0}")]
    UnsupportedVersion(String),

    #[error("signature header is empty")]
    EmptyHeader,

    #[error("must provide at least one secret and one signature")]
    NothingToVerify,
}

// ============================================================================
// Secret
// ============================================================================

/// A parsed signing secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret {
    raw: Vec<u8>,
    encoded: String,
}

impl Secret {
    /// Generate a cryptographically random secret of `size` raw bytes.
    pub fn generate(size: usize) -> Result<Self, SignatureError> {
        if !(MIN_SECRET_BYTES..=MAX_SECRET_BYTES).contains(&size) {
            return Err(SignatureError::SecretSize);
        }

        let mut raw = vec![0u8; size];
        rand::thread_rng().fill_bytes(&mut raw);
        let encoded = format!("{SECRET_PREFIX}{}", BASE64.encode(&raw));
        Ok(Self { raw, encoded })
    }

    /// Parse a `whsec_`-prefixed base64 secret.
    pub fn parse(encoded: &str) -> Result<Self, SignatureError> {
        let b64 = encoded
            .strip_prefix(SECRET_PREFIX)
            .ok_or(SignatureError::MissingPrefix)?;
        let raw = BASE64.decode(b64)?;

        if !(MIN_SECRET_BYTES..=MAX_SECRET_BYTES).contains(&raw.len()) {
            return Err(SignatureError::SecretSize);
        }

        Ok(Self {
            raw,
            encoded: encoded.to_string(),
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.raw
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded)
    }
}

// Keep raw key material out of debug output.
impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("len", &self.raw.len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Signature
// ============================================================================

/// One `version,base64` signature token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub version: String,
    pub signature: String,
}

impl Signature {
    /// Parse a `v1,<base64>` token.
    pub fn parse(token: &str) -> Result<Self, SignatureError> {
        let (version, signature) = token
            .split_once(',')
            .ok_or(SignatureError::MalformedSignature)?;
        Ok(Self {
            version: version.to_string(),
            signature: signature.to_string(),
        })
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.version, self.signature)
    }
}

// ============================================================================
// Sign / verify
// ============================================================================

/// Sign `{msg_id}.{timestamp}.{payload}` with HMAC-SHA256.
///
/// The message id must not contain `.` or the signed content would be
/// ambiguous.
pub fn sign(
    secret: &Secret,
    msg_id: &str,
    timestamp: DateTime<Utc>,
    payload: &[u8],
) -> Result<Signature, SignatureError> {
    if msg_id.contains('.') {
        return Err(SignatureError::DottedMessageId);
    }

    let mut mac = HmacSha256::new_from_slice(secret.bytes())
        .map_err(|_| SignatureError::SecretSize)?;
    mac.update(signed_content(msg_id, timestamp, payload).as_slice());

    Ok(Signature {
        version: SIGNATURE_VERSION.to_string(),
        signature: BASE64.encode(mac.finalize().into_bytes()),
    })
}

/// Verify one signature in constant time.
pub fn verify(
    secret: &Secret,
    msg_id: &str,
    timestamp: DateTime<Utc>,
    payload: &[u8],
    expected: &Signature,
) -> Result<bool, SignatureError> {
    if expected.version != SIGNATURE_VERSION {
        return Err(SignatureError::UnsupportedVersion(expected.version.clone()));
    }
    if msg_id.contains('.') {
        return Err(SignatureError::DottedMessageId);
    }

    let decoded = BASE64.decode(&expected.signature)?;

    let mut mac = HmacSha256::new_from_slice(secret.bytes())
        .map_err(|_| SignatureError::SecretSize)?;
    mac.update(signed_content(msg_id, timestamp, payload).as_slice());

    // verify_slice is a constant-time comparison.
    Ok(mac.verify_slice(&decoded).is_ok())
}

/// Verify against multiple secrets and signatures, succeeding when any pair
/// matches. Supports secret rotation and parallel schemes.
pub fn verify_multiple(
    secrets: &[Secret],
    msg_id: &str,
    timestamp: DateTime<Utc>,
    payload: &[u8],
    signatures: &[Signature],
) -> Result<bool, SignatureError> {
    if secrets.is_empty() || signatures.is_empty() {
        return Err(SignatureError::NothingToVerify);
    }

    for signature in signatures {
        for secret in secrets {
            match verify(secret, msg_id, timestamp, payload, signature) {
                Ok(true) => return Ok(true),
                // Unsupported versions or bad encodings just mean "try the
                // next pair".
                Ok(false) | Err(_) => {}
            }
        }
    }

    Ok(false)
}

/// Parse the `webhook-signature` header: space-separated signature tokens.
pub fn parse_signature_header(header: &str) -> Result<Vec<Signature>, SignatureError> {
    if header.is_empty() {
        return Err(SignatureError::EmptyHeader);
    }

    let signatures = header
        .split(' ')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(Signature::parse)
        .collect::<Result<Vec<_>, _>>()?;

    if signatures.is_empty() {
        return Err(SignatureError::EmptyHeader);
    }
    Ok(signatures)
}

/// Render the `webhook-signature` header value.
pub fn build_signature_header(signatures: &[Signature]) -> String {
    signatures
        .iter()
        .map(Signature::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

fn signed_content(msg_id: &str, timestamp: DateTime<Utc>, payload: &[u8]) -> Vec<u8> {
    let mut content =
        Vec::with_capacity(msg_id.len() + 12 + payload.len());
    content.extend_from_slice(msg_id.as_bytes());
    content.push(b'.');
    content.extend_from_slice(timestamp.timestamp().to_string().as_bytes());
    content.push(b'.');
    content.extend_from_slice(payload);
    content
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn test_secret() -> Secret {
        Secret::parse(&format!("{SECRET_PREFIX}{}", BASE64.encode([0u8; 32]))).unwrap()
    }

    fn test_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn secret_parsing_bounds() {
        assert!(Secret::parse(&format!("{SECRET_PREFIX}{}", BASE64.encode([7u8; 24]))).is_ok());
        assert!(Secret::parse(&format!("{SECRET_PREFIX}{}", BASE64.encode([7u8; 64]))).is_ok());
        assert!(matches!(
            Secret::parse(&format!("{SECRET_PREFIX}{}", BASE64.encode([7u8; 23]))),
            Err(SignatureError::SecretSize)
        ));
        assert!(matches!(
            Secret::parse(&format!("{SECRET_PREFIX}{}", BASE64.encode([7u8; 65]))),
            Err(SignatureError::SecretSize)
        ));
        assert!(matches!(
            Secret::parse("nope_abc"),
            Err(SignatureError::MissingPrefix)
        ));
        assert!(Secret::parse(&format!("{SECRET_PREFIX}not-base64!")).is_err());
    }

    #[test]
    fn generated_secrets_round_trip() {
        let secret = Secret::generate(32).unwrap();
        let reparsed = Secret::parse(&secret.to_string()).unwrap();
        assert_eq!(secret.bytes(), reparsed.bytes());

        assert!(Secret::generate(8).is_err());
        assert!(Secret::generate(100).is_err());
    }

    #[test]
    fn sign_verify_round_trip() {
        let secret = test_secret();
        let sig = sign(&secret, "msg_1", test_time(), b"{\"a\":1}").unwrap();
        assert_eq!(sig.version, SIGNATURE_VERSION);
        assert!(verify(&secret, "msg_1", test_time(), b"{\"a\":1}", &sig).unwrap());
    }

    #[test]
    fn verify_rejects_tampering() {
        let secret = test_secret();
        let sig = sign(&secret, "msg_1", test_time(), b"payload").unwrap();

        assert!(!verify(&secret, "msg_1", test_time(), b"payload2", &sig).unwrap());
        assert!(!verify(&secret, "msg_2", test_time(), b"payload", &sig).unwrap());
        let later = test_time() + chrono::Duration::seconds(1);
        assert!(!verify(&secret, "msg_1", later, b"payload", &sig).unwrap());

        let other = Secret::generate(32).unwrap();
        assert!(!verify(&other, "msg_1", test_time(), b"payload", &sig).unwrap());
    }

    #[test]
    fn sign_rejects_dotted_message_id() {
        let secret = test_secret();
        assert!(matches!(
            sign(&secret, "msg.1", test_time(), b"x"),
            Err(SignatureError::DottedMessageId)
        ));
    }

    #[test]
    fn verify_rejects_unknown_version() {
        let secret = test_secret();
        let sig = Signature {
            version: "v2".to_string(),
            signature: BASE64.encode([0u8; 32]),
        };
        assert!(matches!(
            verify(&secret, "msg_1", test_time(), b"x", &sig),
            Err(SignatureError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn rotation_verifies_against_any_pair() {
        let old = Secret::generate(32).unwrap();
        let new = Secret::generate(32).unwrap();
        let sig = sign(&old, "msg_1", test_time(), b"x").unwrap();

        let secrets = vec![new.clone(), old.clone()];
        assert!(verify_multiple(&secrets, "msg_1", test_time(), b"x", &[sig]).unwrap());

        let unrelated = sign(&new, "other", test_time(), b"y").unwrap();
        assert!(!verify_multiple(
            &[old],
            "msg_1",
            test_time(),
            b"x",
            &[unrelated]
        )
        .unwrap());

        assert!(matches!(
            verify_multiple(&[], "msg_1", test_time(), b"x", &[]),
            Err(SignatureError::NothingToVerify)
        ));
    }

    #[test]
    fn header_round_trip() {
        let secret = test_secret();
        let first = sign(&secret, "msg_1", test_time(), b"x").unwrap();
        let second = sign(&secret, "msg_1", test_time(), b"y").unwrap();

        let header = build_signature_header(&[first.clone(), second.clone()]);
        let parsed = parse_signature_header(&header).unwrap();
        assert_eq!(parsed, vec![first, second]);

        assert!(matches!(
            parse_signature_header(""),
            Err(SignatureError::EmptyHeader)
        ));
        assert!(parse_signature_header("garbage").is_err());
    }

    #[test]
    fn signature_token_format() {
        let sig = Signature::parse("v1,abc123").unwrap();
        assert_eq!(sig.version, "v1");
        assert_eq!(sig.signature, "abc123");
        assert_eq!(sig.to_string(), "v1,abc123");
    }
}
