//! Time budgets for store calls.
//!
//! Every shared-store round trip made by the guard or the session manager is
//! wrapped here so a hung backend turns into a [`StoreError::Timeout`].

use super::{StoreError, StoreResult};
use std::time::Duration;
use tokio::time::timeout;

/// Default budget for a single store call (2 seconds)
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(2);

/// Budget for bulk maintenance such as purging (30 seconds)
pub const MAINTENANCE_TIMEOUT: Duration = Duration::from_secs(30);

/// Execute a store call with a timeout
///
/// # Arguments
///
/// * `duration` - Timeout duration
/// * `future` - Store operation to execute
///
/// # Returns
///
/// * `StoreResult<T>` - Result, store error, or timeout error
///
/// # Example
///
/// ```no_run
/// use session_guard::store::{CounterStore, MemoryStore};
/// use session_guard::store::timeouts::{with_timeout, DEFAULT_STORE_TIMEOUT};
/// # async fn example() -> Result<(), session_guard::store::StoreError> {
/// let store = MemoryStore::new();
/// with_timeout(DEFAULT_STORE_TIMEOUT, store.clear("login:id:alice")).await?;
/// # Ok(())
/// # }
/// ```
pub async fn with_timeout<F, T>(duration: Duration, future: F) -> StoreResult<T>
where
    F: std::future::Future<Output = StoreResult<T>>,
{
    match timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(duration)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_timeout_constants() {
        assert_eq!(DEFAULT_STORE_TIMEOUT.as_secs(), 2);
        assert_eq!(MAINTENANCE_TIMEOUT.as_secs(), 30);
    }

    #[tokio::test]
    async fn test_timeout_error_display() {
        let err = StoreError::Timeout(Duration::from_secs(5));
        assert!(err.to_string().contains("timed out"));
        assert!(err.to_string().contains("5s"));
    }

    #[tokio::test]
    async fn test_slow_call_times_out() {
        let result = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, StoreError>(1)
        })
        .await;

        assert!(matches!(result, Err(StoreError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_fast_call_passes_through() {
        let result = with_timeout(Duration::from_secs(1), async { Ok::<_, StoreError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }
}
