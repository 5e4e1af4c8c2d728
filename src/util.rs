use std::{future::Future, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::time::timeout;

/// Wraps `tokio::time::timeout`, converting elapsed deadlines and inner errors into contextual
/// `anyhow::Error` values for consistent diagnostics.
pub async fn timeout_with_context<F, T, E>(
    duration: Duration,
    future: F,
    context: impl Into<String>,
) -> Result<T>
where
    F: Future<Output = Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let context = context.into();
    timeout(duration, future)
        .await
        .map_err(|_| anyhow!("timed out {context}"))?
        .with_context(|| format!("failed while {context}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn reports_timeout_with_context() {
        let pending = std::future::pending::<Result<(), std::io::Error>>();
        let task = tokio::spawn(timeout_with_context(
            Duration::from_millis(10),
            pending,
            "waiting forever",
        ));
        tokio::time::advance(Duration::from_millis(20)).await;
        let err = task.await.expect("join").expect_err("should time out");
        assert!(err.to_string().contains("timed out waiting forever"));
    }

    #[tokio::test]
    async fn passes_through_success() {
        let value = timeout_with_context(
            Duration::from_secs(1),
            std::future::ready(Ok::<_, std::io::Error>(7)),
            "immediate",
        )
        .await
        .expect("should succeed");
        assert_eq!(value, 7);
    }
}
