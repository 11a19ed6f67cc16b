//! Liveness probing for transports that cannot signal a half-open connection.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::errors::McpError;

/// A running heartbeat loop. Stops on [`Heartbeat::stop`], on drop, or by
/// itself once the failure budget is spent.
#[derive(Debug)]
pub struct Heartbeat {
    handle: JoinHandle<()>,
}

impl Heartbeat {
    /// Start probing every `interval`.
    ///
    /// A successful probe resets the failure count. After `max_failures`
    /// consecutive failures (at least one) the loop ends and `on_dead` runs
    /// once; the timer does not fire again.
    pub fn spawn<P, Fut, D>(
        server_id: &str,
        interval: Duration,
        max_failures: u32,
        mut probe: P,
        on_dead: D,
    ) -> Self
    where
        P: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), McpError>> + Send + 'static,
        D: FnOnce(String) + Send + 'static,
    {
        let server_id = server_id.to_string();
        let max_failures = max_failures.max(1);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; the connection was just
            // proven by the handshake.
            ticker.tick().await;

            let mut failures = 0u32;
            loop {
                ticker.tick().await;
                match probe().await {
                    Ok(()) => {
                        if failures > 0 {
                            tracing::info!(server = %server_id, "heartbeat recovered");
                        }
                        failures = 0;
                    }
                    Err(e) => {
                        failures += 1;
                        tracing::warn!(
                            server = %server_id,
                            error = %e,
                            failures,
                            max_failures,
                            "heartbeat probe failed"
                        );
                        if failures >= max_failures {
                            on_dead(format!("heartbeat failed {failures} time(s): {e}"));
                            return;
                        }
                    }
                }
            }
        });

        Self { handle }
    }

    pub fn stop(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
