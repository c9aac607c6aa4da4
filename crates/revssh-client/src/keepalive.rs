//! Keepalive monitor for the reverse client's outbound connection.
//!
//! Pings the broker every interval. Each ping must finish within one
//! interval. After `max_failures` consecutive failures the connection is
//! closed; a success resets the count.

use revssh_core::{RevsshError, RevsshResult};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// A connection that can be pinged and force-closed.
pub trait KeepaliveTarget: Send + Sync {
    fn ping(&self) -> Pin<Box<dyn Future<Output = RevsshResult<()>> + Send + '_>>;

    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Ping until `max_failures` consecutive pings fail, then close the
/// connection. Only returns after closing.
pub async fn run_keepalive<P>(target: &P, interval: Duration, max_failures: u32) -> RevsshError
where
    P: KeepaliveTarget + ?Sized,
{
    let mut failures = 0u32;
    loop {
        sleep(interval).await;
        let outcome = match timeout(interval, target.ping()).await {
            Ok(result) => result,
            Err(_) => Err(RevsshError::Timeout),
        };

        match outcome {
            Ok(()) => {
                if failures > 0 {
                    debug!(after = failures, "keepalive recovered");
                }
                failures = 0;
            }
            Err(e) => {
                failures += 1;
                warn!(failures, max_failures, error = %e, "keepalive failed");
                if failures >= max_failures {
                    target.close().await;
                    return RevsshError::KeepaliveExhausted(failures);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    enum Step {
        Ok,
        Fail,
        Hang,
    }

    /// Plays back a script of ping outcomes, then succeeds forever.
    struct ScriptedTarget {
        script: Mutex<VecDeque<Step>>,
        pings: AtomicUsize,
        closes: AtomicUsize,
    }

    impl ScriptedTarget {
        fn new(script: Vec<Step>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                pings: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
            }
        }
    }

    impl KeepaliveTarget for ScriptedTarget {
        fn ping(&self) -> Pin<Box<dyn Future<Output = RevsshResult<()>> + Send + '_>> {
            self.pings.fetch_add(1, Ordering::SeqCst);
            let step = self.script.lock().unwrap().pop_front().unwrap_or(Step::Ok);
            Box::pin(async move {
                match step {
                    Step::Ok => Ok(()),
                    Step::Fail => Err(RevsshError::RequestFailed("no reply".into())),
                    Step::Hang => std::future::pending().await,
                }
            })
        }

        fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        }
    }

    const INTERVAL: Duration = Duration::from_secs(5);

    #[tokio::test(start_paused = true)]
    async fn five_failures_close_the_connection() {
        let target = ScriptedTarget::new((0..5).map(|_| Step::Fail).collect());
        let err = run_keepalive(&target, INTERVAL, 5).await;
        assert!(matches!(err, RevsshError::KeepaliveExhausted(5)));
        assert_eq!(target.closes.load(Ordering::SeqCst), 1);
        assert_eq!(target.pings.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn four_failures_do_not() {
        let mut script: Vec<Step> = (0..4).map(|_| Step::Fail).collect();
        script.push(Step::Ok);
        script.extend((0..4).map(|_| Step::Fail));
        let target = ScriptedTarget::new(script);

        let outcome = timeout(Duration::from_secs(120), run_keepalive(&target, INTERVAL, 5)).await;
        assert!(outcome.is_err(), "keepalive gave up early");
        assert_eq!(target.closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_pings_count_as_failures() {
        let target = ScriptedTarget::new((0..5).map(|_| Step::Hang).collect());
        let start = tokio::time::Instant::now();
        run_keepalive(&target, INTERVAL, 5).await;
        assert_eq!(target.closes.load(Ordering::SeqCst), 1);
        // five sleeps plus five timed-out pings
        assert!(start.elapsed() >= INTERVAL * 10);
    }
}
