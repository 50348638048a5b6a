//! PKCE (RFC 7636): Proof Key for Code Exchange.

use std::str::FromStr;

use base64::Engine;
use sha2::{Digest, Sha256};

/// PKCE code challenge methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeChallengeMethod {
    Plain,
    S256,
}

impl CodeChallengeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::S256 => "S256",
        }
    }

    /// An absent method means `plain`, as RFC 7636 §4.3 prescribes.
    pub fn from_optional(method: Option<&str>) -> Result<Self, PkceError> {
        match method {
            None => Ok(Self::Plain),
            Some(m) => m.parse(),
        }
    }
}

impl FromStr for CodeChallengeMethod {
    type Err = PkceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plain" => Ok(Self::Plain),
            "S256" => Ok(Self::S256),
            other => Err(PkceError::UnsupportedMethod(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PkceError {
    #[error("unsupported code challenge method {0:?}")]
    UnsupportedMethod(String),

    #[error("plain code challenges are disabled")]
    PlainDisabled,

    #[error("code challenge or verifier is malformed")]
    Malformed,

    #[error("code verifier does not match the challenge")]
    Mismatch,
}

/// Generate a code challenge from a code verifier.
pub fn generate_code_challenge(verifier: &str, method: CodeChallengeMethod) -> String {
    match method {
        CodeChallengeMethod::Plain => verifier.to_string(),
        CodeChallengeMethod::S256 => {
            let mut hasher = Sha256::new();
            hasher.update(verifier.as_bytes());
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(hasher.finalize())
        }
    }
}

/// 43-128 characters from the unreserved set `[A-Za-z0-9-._~]`.
fn is_well_formed(value: &str) -> bool {
    (43..=128).contains(&value.len())
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~'))
}

/// Check a challenge presented at authorize time and resolve its method.
pub fn validate_challenge(
    challenge: &str,
    method: Option<&str>,
    allow_plain: bool,
) -> Result<CodeChallengeMethod, PkceError> {
    let method = CodeChallengeMethod::from_optional(method)?;
    if method == CodeChallengeMethod::Plain && !allow_plain {
        return Err(PkceError::PlainDisabled);
    }
    if !is_well_formed(challenge) {
        return Err(PkceError::Malformed);
    }
    Ok(method)
}

/// Verify a code verifier against a stored code challenge in constant time.
pub fn verify_code_verifier(
    verifier: &str,
    challenge: &str,
    method: Option<&str>,
) -> Result<(), PkceError> {
    let method = CodeChallengeMethod::from_optional(method)?;
    if !is_well_formed(verifier) {
        return Err(PkceError::Malformed);
    }

    let computed = generate_code_challenge(verifier, method);
    if subtle::ConstantTimeEq::ct_eq(computed.as_bytes(), challenge.as_bytes()).into() {
        Ok(())
    } else {
        Err(PkceError::Mismatch)
    }
}

/// Generate a cryptographically random code verifier (43-128 chars, URL-safe).
pub fn generate_code_verifier() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let length = rng.gen_range(43..=128);
    let bytes: Vec<u8> = (0..length).map(|_| rng.gen()).collect();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&bytes)[..length].to_string()
}
