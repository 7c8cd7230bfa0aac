//! Engine error helpers.

use std::time::Duration;

use anyhow::Result;
use futures::Future;

pub use wharf_core::PlatformError;

/// Whether the given kube error is an API error with the given status code.
pub fn is_api_code(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(api_err) if api_err.code == code)
}

/// Whether the given kube error is a 404.
pub fn is_not_found(err: &kube::Error) -> bool {
    is_api_code(err, http::StatusCode::NOT_FOUND.as_u16())
}

/// Whether the given kube error is a 409 conflict.
pub fn is_conflict(err: &kube::Error) -> bool {
    is_api_code(err, http::StatusCode::CONFLICT.as_u16())
}

/// Map a kube error into the platform taxonomy for the given resource.
pub fn map_resource_err(err: kube::Error, kind: &str, name: &str) -> anyhow::Error {
    if is_not_found(&err) {
        return PlatformError::ResourceMissing {
            kind: kind.into(),
            name: name.into(),
        }
        .into();
    }
    if is_conflict(&err) {
        return PlatformError::ResourceDuplicate {
            kind: kind.into(),
            name: name.into(),
        }
        .into();
    }
    err.into()
}

/// Number of attempts made for transient upstream failures.
const RETRY_ATTEMPTS: u32 = 3;
/// Base delay of the retry backoff.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Retry the given op with bounded exponential backoff.
///
/// Only errors classified as transient by `is_transient` are retried; terminal
/// errors and the final failure are promoted to the caller.
pub async fn retry_transient<T, F, Fut, P>(mut op: F, is_transient: P) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&anyhow::Error) -> bool,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(val) => return Ok(val),
            Err(err) => {
                attempt += 1;
                if attempt >= RETRY_ATTEMPTS || !is_transient(&err) {
                    return Err(err);
                }
                let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                tracing::warn!(error = ?err, attempt, "transient upstream error, retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}
