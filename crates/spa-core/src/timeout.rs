//! Call bounds for external operations

use crate::error::TimedOut;
use std::future::Future;
use std::time::Duration;

/// Run `call`, failing with a timeout error once `limit` elapses
///
/// # Errors
/// Returns the call's own error, or `E::timed_out` on expiry
pub async fn bounded<T, E, F>(operation: &'static str, limit: Duration, call: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: TimedOut,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => {
            let after_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
            tracing::warn!(operation, after_ms, "external call timed out");
            Err(E::timed_out(operation, after_ms))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExternalError;

    #[tokio::test(start_paused = true)]
    async fn elapsed_call_becomes_timeout() {
        let result: Result<(), ExternalError> = bounded("usage", Duration::from_secs(5), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;

        assert_eq!(
            result,
            Err(ExternalError::Timeout { operation: "usage", after_ms: 5_000 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn fast_call_passes_through() {
        let result: Result<u32, ExternalError> =
            bounded("usage", Duration::from_secs(5), async { Ok(7) }).await;
        assert_eq!(result, Ok(7));
    }
}
