//! Quota-exceeded retry/cleanup for persistent backends (§4.2.1).

use polycache_core::{BackendError, PolycacheError, PolycacheResult};

const MAX_ATTEMPTS: u32 = 3;

/// Runs `write`; on `BackendError::QuotaExceeded` runs `cleanup(percent)` and
/// retries, up to [`MAX_ATTEMPTS`] times. The first cleanup removes the
/// oldest 25% of item entries; subsequent cleanups remove 50%. Any other
/// error, or exhausting all attempts, fails immediately.
pub fn write_with_quota_retry<W, C>(mut write: W, mut cleanup: C) -> PolycacheResult<()>
where
    W: FnMut() -> PolycacheResult<()>,
    C: FnMut(f64) -> PolycacheResult<()>,
{
    let mut attempt = 0u32;
    loop {
        match write() {
            Ok(()) => return Ok(()),
            Err(PolycacheError::Backend(BackendError::QuotaExceeded { .. })) => {
                attempt += 1;
                if attempt > MAX_ATTEMPTS {
                    tracing::warn!(attempts = attempt - 1, "quota retry exhausted, giving up");
                    return Err(BackendError::QuotaExceeded { attempts: attempt - 1 }.into());
                }
                let percent = if attempt == 1 { 0.25 } else { 0.5 };
                tracing::debug!(attempt, percent, "quota exceeded, running cleanup and retrying");
                cleanup(percent)?;
            }
            Err(other) => return Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn succeeds_immediately_when_no_quota_error() {
        let result = write_with_quota_retry(|| Ok(()), |_| Ok(()));
        assert!(result.is_ok());
    }

    #[test]
    fn retries_with_progressive_cleanup_percentages_then_succeeds() {
        let attempts = RefCell::new(0u32);
        let cleanups = RefCell::new(Vec::new());
        let result = write_with_quota_retry(
            || {
                *attempts.borrow_mut() += 1;
                if *attempts.borrow() <= 2 {
                    Err(BackendError::QuotaExceeded { attempts: 0 }.into())
                } else {
                    Ok(())
                }
            },
            |percent| {
                cleanups.borrow_mut().push(percent);
                Ok(())
            },
        );
        assert!(result.is_ok());
        assert_eq!(*cleanups.borrow(), vec![0.25, 0.5]);
    }

    #[test]
    fn fails_with_quota_error_after_exhausting_attempts() {
        let result = write_with_quota_retry(
            || Err(BackendError::QuotaExceeded { attempts: 0 }.into()),
            |_| Ok(()),
        );
        assert!(matches!(
            result,
            Err(PolycacheError::Backend(BackendError::QuotaExceeded { attempts: 3 }))
        ));
    }

    #[test]
    fn non_quota_errors_fail_immediately_without_cleanup() {
        let cleanup_calls = RefCell::new(0u32);
        let result = write_with_quota_retry(
            || Err(BackendError::Io { reason: "disk gone".into() }.into()),
            |_| {
                *cleanup_calls.borrow_mut() += 1;
                Ok(())
            },
        );
        assert!(result.is_err());
        assert_eq!(*cleanup_calls.borrow(), 0);
    }
}
