use std::future::Future;
use std::time::Duration;

/// Run an I/O future under an optional per-operation deadline.
///
/// `None` means no deadline; expiry surfaces as an `io::Error` of kind
/// `TimedOut` so callers keep a single error path.
pub(crate) async fn timed<F, T>(limit: Option<Duration>, fut: F) -> std::io::Result<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    match limit {
        Some(dur) => match tokio::time::timeout(dur, fut).await {
            Ok(res) => res,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "operation timed out",
            )),
        },
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn timed_expiry_is_timed_out() {
        let err = timed(Some(Duration::from_millis(5)), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn timed_none_never_expires() {
        let value = timed(None, async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }
}
