//! Test fixtures and environment helpers.

use std::future::Future;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use tokio::time::{Instant, sleep};

/// Returns `true` if a Docker daemon is reachable for container-backed tests.
#[must_use]
pub fn docker_available() -> bool {
    docker_reachable(std::env::var("DOCKER_HOST").ok().as_deref())
}

fn docker_reachable(host: Option<&str>) -> bool {
    match host {
        Some(host) => host
            .strip_prefix("unix://")
            .is_none_or(|socket| Path::new(socket).exists()),
        None => {
            Path::new("/var/run/docker.sock").exists()
                || Command::new("docker")
                    .arg("info")
                    .output()
                    .is_ok_and(|output| output.status.success())
        }
    }
}

/// Poll `check` every 10ms until it yields `Some` or `limit` elapses.
pub async fn eventually<T, F, Fut>(limit: Duration, mut check: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = Instant::now() + limit;
    loop {
        if let Some(value) = check().await {
            return Some(value);
        }
        if Instant::now() >= deadline {
            return None;
        }
        sleep(Duration::from_millis(10)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn unix_host_requires_socket() {
        assert!(!docker_reachable(Some("unix:///definitely/missing.sock")));
    }

    #[test]
    fn tcp_host_is_trusted() {
        assert!(docker_reachable(Some("tcp://127.0.0.1:2375")));
    }

    #[tokio::test]
    async fn eventually_retries_until_ready() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = eventually(Duration::from_secs(1), || {
            let calls = Arc::clone(&calls);
            async move { (calls.fetch_add(1, Ordering::SeqCst) >= 3).then_some(()) }
        })
        .await;
        assert!(seen.is_some());
        assert!(calls.load(Ordering::SeqCst) >= 4);
    }

    #[tokio::test]
    async fn eventually_gives_up() {
        let seen: Option<()> = eventually(Duration::from_millis(30), || async { None }).await;
        assert!(seen.is_none());
    }
}
