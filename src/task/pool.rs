//! Bounded concurrent fan-out over the host list
//!
//! At most `concurrency` hosts run at any instant; scheduling is FIFO
//! over the input list and results stream back in completion order. A
//! panic inside one host's work is isolated and reported as a failure
//! for that host only.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, warn};

use crate::ssh::SshError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Success,
    Failure,
}

impl fmt::Display for HostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostStatus::Success => f.write_str("success"),
            HostStatus::Failure => f.write_str("failed"),
        }
    }
}

/// Outcome of one host: captured output on success, the classified
/// cause on failure.
#[derive(Debug, Clone, Serialize)]
pub struct HostResult {
    pub host: String,
    pub status: HostStatus,
    pub message: String,
}

/// Fan `run` out over `hosts` with at most `concurrency` in flight.
///
/// The returned channel has capacity for every host, so worker sends
/// never block on a slow consumer. Each host yields exactly one result
/// unless `cancel` flips first, in which case remaining workers are
/// abandoned and the channel closes once in-flight sends finish.
pub(crate) fn spawn_batch<F, Fut>(
    hosts: Vec<String>,
    concurrency: usize,
    cancel: watch::Receiver<bool>,
    run: F,
) -> mpsc::Receiver<HostResult>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, SshError>> + Send + 'static,
{
    let concurrency = concurrency.max(1);
    let (tx, rx) = mpsc::channel(hosts.len().max(1));
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let run = Arc::new(run);

    tokio::spawn(async move {
        for host in hosts {
            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
                _ = cancelled(cancel.clone()) => break,
            };

            let tx = tx.clone();
            let run = run.clone();
            let cancel = cancel.clone();

            tokio::spawn(async move {
                let _permit = permit;

                // A second task level so a panic in the work future
                // cannot take this wrapper (and its result send) down.
                let worker_host = host.clone();
                let mut work = tokio::spawn(async move { run(worker_host).await });

                let result = tokio::select! {
                    _ = cancelled(cancel) => {
                        debug!(host = %host, "abandoned at task deadline");
                        work.abort();
                        return;
                    }
                    joined = &mut work => match joined {
                        Ok(Ok(message)) => HostResult {
                            host,
                            status: HostStatus::Success,
                            message,
                        },
                        Ok(Err(e)) => HostResult {
                            host,
                            status: HostStatus::Failure,
                            message: e.to_string(),
                        },
                        Err(e) => {
                            warn!(error = %e, "host worker did not finish");
                            HostResult {
                                host,
                                status: HostStatus::Failure,
                                message: format!("worker panicked: {e}"),
                            }
                        }
                    },
                };

                let _ = tx.send(result).await;
            });
        }
    });

    rx
}

/// Resolves once the cancel signal flips to true; pends forever when the
/// sender is gone (no cancellation can happen anymore).
async fn cancelled(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn hosts(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("host{i}")).collect()
    }

    fn no_cancel() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        // Leak the sender so the signal can never fire.
        std::mem::forget(tx);
        rx
    }

    async fn drain(mut rx: mpsc::Receiver<HostResult>) -> Vec<HostResult> {
        let mut out = Vec::new();
        while let Some(r) = rx.recv().await {
            out.push(r);
        }
        out
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn every_host_yields_exactly_one_result() {
        let rx = spawn_batch(hosts(10), 4, no_cancel(), |host| async move { Ok(host) });
        let results = drain(rx).await;
        assert_eq!(results.len(), 10);

        let mut names: Vec<_> = results.iter().map(|r| r.host.clone()).collect();
        names.sort();
        let mut expected = hosts(10);
        expected.sort();
        assert_eq!(names, expected);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn in_flight_never_exceeds_concurrency() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let rx = {
            let current = current.clone();
            let peak = peak.clone();
            spawn_batch(hosts(12), 3, no_cancel(), move |host| {
                let current = current.clone();
                let peak = peak.clone();
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(host)
                }
            })
        };

        let results = drain(rx).await;
        assert_eq!(results.len(), 12);
        assert!(peak.load(Ordering::SeqCst) <= 3, "peak {}", peak.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn a_panicking_host_does_not_stop_the_others() {
        let rx = spawn_batch(hosts(5), 2, no_cancel(), |host| async move {
            if host == "host2" {
                panic!("boom");
            }
            Ok(host)
        });

        let results = drain(rx).await;
        assert_eq!(results.len(), 5);

        let bad = results.iter().find(|r| r.host == "host2").unwrap();
        assert_eq!(bad.status, HostStatus::Failure);
        assert!(bad.message.contains("panicked"));
        assert_eq!(
            results.iter().filter(|r| r.status == HostStatus::Success).count(),
            4
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn errors_become_failure_results() {
        let rx = spawn_batch(hosts(3), 1, no_cancel(), |host| async move {
            if host == "host1" {
                Err(SshError::Unreachable("connection refused".to_string()))
            } else {
                Ok(host)
            }
        });

        let results = drain(rx).await;
        let bad = results.iter().find(|r| r.host == "host1").unwrap();
        assert_eq!(bad.status, HostStatus::Failure);
        assert!(bad.message.contains("unreachable"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn zero_concurrency_is_clamped_to_one() {
        let rx = spawn_batch(hosts(3), 0, no_cancel(), |host| async move { Ok(host) });
        assert_eq!(drain(rx).await.len(), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancel_abandons_pending_hosts_and_closes_the_stream() {
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let rx = spawn_batch(hosts(6), 2, cancel_rx, |host| async move {
            if host == "host0" || host == "host1" {
                Ok(host)
            } else {
                // Would run forever without cancellation.
                std::future::pending::<()>().await;
                unreachable!()
            }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel_tx.send(true).unwrap();

        let results = drain(rx).await;
        assert!(results.len() < 6);
        for r in results {
            assert_eq!(r.status, HostStatus::Success);
        }
    }
}
