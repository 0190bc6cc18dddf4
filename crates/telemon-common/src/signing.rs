use base64::{engine::general_purpose, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::WireError;

/// Header carrying the base64 HMAC-SHA256 of the body it accompanies.
pub const HASH_HEADER: &str = "HashSHA256";

type HmacSha256 = Hmac<Sha256>;

fn mac(key: &[u8], data: &[u8]) -> HmacSha256 {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac
}

/// Base64 HMAC-SHA256 of `data` under `key`.
pub fn sign(key: &[u8], data: &[u8]) -> String {
    general_purpose::STANDARD.encode(mac(key, data).finalize().into_bytes())
}

/// Checks `signature` (as found in [`HASH_HEADER`]) against `data`.
///
/// The comparison is constant-time.
pub fn verify(key: &[u8], data: &[u8], signature: &str) -> Result<(), WireError> {
    let expected = general_purpose::STANDARD
        .decode(signature.trim())
        .map_err(|_| WireError::MalformedSignature)?;
    mac(key, data)
        .verify_slice(&expected)
        .map_err(|_| WireError::SignatureMismatch)
}
