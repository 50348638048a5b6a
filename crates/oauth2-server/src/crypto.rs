// Resource-owner password hashing.
//
// Uses scrypt (N=16384, r=16, p=1, dkLen=64) with a random 16-byte salt.
// Output format: "hex(salt):hex(key)"

use rand::RngCore;
use scrypt::{scrypt, Params};
use subtle::ConstantTimeEq;

use crate::error::ServerError;

/// Hash a password for storage in the user directory.
pub fn hash_password(password: &str) -> Result<String, ServerError> {
    let mut salt_bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt_bytes);
    let salt_hex = hex::encode(salt_bytes);

    let key = derive_key(password, &salt_hex)?;
    Ok(format!("{}:{}", salt_hex, hex::encode(key)))
}

/// Verify a password against a hash produced by [`hash_password`].
///
/// The key comparison is constant-time. A malformed hash is an error, not
/// a mismatch.
pub fn verify_password(hash: &str, password: &str) -> Result<bool, ServerError> {
    let (salt, key_hex) = hash
        .split_once(':')
        .ok_or_else(|| ServerError::Crypto("invalid password hash format".into()))?;

    let expected =
        hex::decode(key_hex).map_err(|e| ServerError::Crypto(format!("invalid hex in password hash: {e}")))?;
    let derived = derive_key(password, salt)?;

    Ok(derived.ct_eq(&expected).into())
}

/// Well-formed hash no password matches. Verifying against it costs one
/// full key derivation.
pub(crate) const DECOY_PASSWORD_HASH: &str = concat!(
    "5f0c2a9d41e873b6c0d4a7e19b3f2c58",
    ":",
    "00000000000000000000000000000000",
    "00000000000000000000000000000000",
    "00000000000000000000000000000000",
    "00000000000000000000000000000000",
);

/// [`verify_password`] on the blocking pool, off the async workers.
pub async fn verify_password_blocking(hash: String, password: String) -> Result<bool, ServerError> {
    tokio::task::spawn_blocking(move || verify_password(&hash, &password))
        .await
        .map_err(|e| ServerError::Crypto(format!("password verification task failed: {e}")))?
}

fn derive_key(password: &str, salt: &str) -> Result<Vec<u8>, ServerError> {
    // log2(N)=14
    let params =
        Params::new(14, 16, 1, 64).map_err(|e| ServerError::Crypto(format!("invalid scrypt params: {e}")))?;

    let mut output = vec![0u8; 64];
    scrypt(password.as_bytes(), salt.as_bytes(), &params, &mut output)
        .map_err(|e| ServerError::Crypto(format!("scrypt failed: {e}")))?;
    Ok(output)
}
