use tokio::time::Instant;

/// Sleeps until `deadline`, or forever when no deadline is armed.
pub async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
