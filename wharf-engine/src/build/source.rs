//! Source blob access.
//!
//! Builds read source tarballs from the object store via pre-signed URLs.
//! Transient network errors are retried with bounded backoff; a partial read
//! is handled by re-fetching the whole body.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

use crate::error::retry_transient;
use wharf_core::PlatformError;

/// Hex SHA-256 of the given bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().iter().map(|byte| format!("{:02x}", byte)).collect()
}

/// Whether the given error warrants a re-fetch.
fn is_transient(err: &anyhow::Error) -> bool {
    match err.downcast_ref::<reqwest::Error>() {
        Some(req_err) => req_err.is_timeout() || req_err.is_connect() || req_err.status().map(|code| code.is_server_error()).unwrap_or(true),
        None => false,
    }
}

/// Fetch the blob behind the given pre-signed URL.
pub async fn fetch_blob(http: &reqwest::Client, url: &str) -> Result<Vec<u8>> {
    retry_transient(
        || async {
            let res = http.get(url).send().await.context("error fetching blob")?;
            let res = res.error_for_status().context("blob fetch rejected")?;
            let body = res.bytes().await.context("error reading blob body")?;
            Ok(body.to_vec())
        },
        is_transient,
    )
    .await
}

/// Fetch the blob behind the given pre-signed URL & verify its digest.
pub async fn fetch_verified(http: &reqwest::Client, url: &str, expected_sha256: &str) -> Result<Vec<u8>> {
    let body = fetch_blob(http, url).await?;
    let digest = sha256_hex(&body);
    if digest != expected_sha256 {
        return Err(PlatformError::InvalidInput(format!(
            "source blob digest mismatch: expected {} got {}",
            expected_sha256, digest
        ))
        .into());
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::sha256_hex;

    #[test]
    fn sha256_hex_matches_known_vector() {
        assert_eq!(sha256_hex(b""), "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855");
    }
}
