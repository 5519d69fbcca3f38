/*!

Fan-out of independent requests with a single join. Every request gets its own task, the results
are collected into a [`ResultMap`] behind one mutex, and the map is returned once the slowest
request has finished.

!*/

use crate::request::{ProbeResult, RequestDescriptor, ResultMap};
use futures::future::join_all;
use log::{debug, error, warn};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};

/// Issues a batch of requests concurrently.
///
/// There is no per-request timeout and no cancellation: a hung request hangs the whole batch, so
/// `issue` functions that can block must bound themselves. `issue` is expected to report failures
/// inside [`ProbeResult::error`]. If it panics, the panic is resumed on the caller once every other
/// request has completed.
#[derive(Debug, Clone, Copy, Default)]
pub struct Aggregator {
    max_in_flight: Option<usize>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the number of requests in flight at once. `None` or `Some(0)` leaves the fan-out
    /// unbounded, which is the default.
    pub fn with_max_in_flight(mut self, limit: Option<usize>) -> Self {
        self.max_in_flight = limit.filter(|&n| n > 0);
        self
    }

    pub fn max_in_flight(&self) -> Option<usize> {
        self.max_in_flight
    }

    /// Runs `issue` for every descriptor and returns the results keyed by source and destination.
    ///
    /// Descriptors that share a (source, destination) pair overwrite each other, last write wins.
    pub async fn run_all<F, Fut>(&self, descriptors: Vec<RequestDescriptor>, issue: F) -> ResultMap
    where
        F: Fn(RequestDescriptor) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ProbeResult> + Send + 'static,
    {
        // Seed every entry up front so the map has its final shape before any request returns.
        let (seeded, _) = seed(&descriptors);
        let results = Arc::new(Mutex::new(seeded));
        let issue = Arc::new(issue);
        let limit = self.max_in_flight.map(|n| Arc::new(Semaphore::new(n)));
        debug!(
            "Issuing {} requests (max in flight: {:?})",
            descriptors.len(),
            self.max_in_flight
        );

        let handles = descriptors
            .into_iter()
            .map(|descriptor| {
                let results = Arc::clone(&results);
                let issue = Arc::clone(&issue);
                let limit = limit.clone();
                tokio::spawn(async move {
                    let _permit = match limit {
                        Some(semaphore) => semaphore.acquire_owned().await.ok(),
                        None => None,
                    };
                    let result = (*issue)(descriptor.clone()).await;
                    debug!("{}: status {}", descriptor, result.status_code);
                    results.lock().await.insert(&descriptor, result);
                })
            })
            .collect::<Vec<_>>();

        let mut panic = None;
        for joined in join_all(handles).await {
            if let Err(e) = joined {
                if e.is_panic() {
                    panic.get_or_insert(e.into_panic());
                } else {
                    error!("Request task did not complete: {}", e);
                }
            }
        }
        if let Some(payload) = panic {
            std::panic::resume_unwind(payload);
        }

        let mut guard = results.lock().await;
        std::mem::take(&mut *guard)
    }
}

/// Builds a map holding the zero result for every descriptor. Returns the map and the number of
/// descriptors that repeated an earlier (source, destination) pair, each of which is logged.
fn seed(descriptors: &[RequestDescriptor]) -> (ResultMap, usize) {
    let mut seeded = ResultMap::default();
    let mut duplicates = 0;
    for descriptor in descriptors {
        if seeded.insert(descriptor, ProbeResult::default()).is_some() {
            duplicates += 1;
            warn!(
                "Duplicate request '{}', results for this pair will overwrite each other",
                descriptor
            );
        }
    }
    (seeded, duplicates)
}

/// Shorthand for `Aggregator::default().run_all(descriptors, issue)`.
pub async fn run_all<F, Fut>(descriptors: Vec<RequestDescriptor>, issue: F) -> ResultMap
where
    F: Fn(RequestDescriptor) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ProbeResult> + Send + 'static,
{
    Aggregator::default().run_all(descriptors, issue).await
}

#[cfg(test)]
mod test {
    use super::*;
    use maplit::btreemap;
    use std::collections::{BTreeMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Barrier;

    fn descriptors(count: usize) -> Vec<RequestDescriptor> {
        (0..count)
            .map(|i| {
                RequestDescriptor::new(
                    format!("ns-{}", i % 4),
                    format!("client-{}", i % 7),
                    format!("http://server-{}.mesh:8080/", i),
                )
            })
            .collect()
    }

    fn index_of(descriptor: &RequestDescriptor) -> usize {
        descriptor
            .destination
            .trim_start_matches("http://server-")
            .split('.')
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap()
    }

    #[tokio::test]
    async fn every_descriptor_is_issued_once() {
        let count = 25;
        let calls: Arc<Vec<AtomicUsize>> =
            Arc::new((0..count).map(|_| AtomicUsize::new(0)).collect());
        let recorded = Arc::clone(&calls);
        let results = run_all(descriptors(count), move |d| {
            let calls = Arc::clone(&recorded);
            async move {
                calls[index_of(&d)].fetch_add(1, Ordering::SeqCst);
                ProbeResult::ok(200, BTreeMap::new())
            }
        })
        .await;

        assert!(calls.iter().all(|c| c.load(Ordering::SeqCst) == 1));
        assert_eq!(results.len(), count);
        assert!(results.iter().all(|(_, _, r)| r.status_code == 200));
        assert!(results.failures().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writes_keep_every_result() {
        let _ = env_logger::builder().is_test(true).try_init();
        let count = 200;
        let results = run_all(descriptors(count), |d| async move {
            let i = index_of(&d);
            tokio::task::yield_now().await;
            ProbeResult::ok(
                200 + (i % 100) as u16,
                btreemap! {"x-request-index".to_string() => i.to_string()},
            )
        })
        .await;

        assert_eq!(results.len(), count);
        for d in descriptors(count) {
            let i = index_of(&d);
            let result = results.result(&d).unwrap();
            assert_eq!(result.status_code, 200 + (i % 100) as u16);
            assert_eq!(result.headers["x-request-index"], i.to_string());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn duplicate_pair_keeps_one_complete_result() {
        let _ = env_logger::builder().is_test(true).try_init();
        let first = RequestDescriptor::new("ns", "client", "server");
        let second = first.clone();
        let issued = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&issued);
        let results = run_all(vec![first.clone(), second], move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                ProbeResult::ok(
                    201 + n as u16,
                    btreemap! {"attempt".to_string() => n.to_string()},
                )
            }
        })
        .await;

        assert_eq!(issued.load(Ordering::SeqCst), 2);
        assert_eq!(results.len(), 1);
        let result = results.result(&first).unwrap();
        let expected: HashSet<(u16, String)> =
            [(201, "0".to_string()), (202, "1".to_string())].into();
        assert!(expected.contains(&(result.status_code, result.headers["attempt"].clone())));
    }

    #[tokio::test]
    async fn unbounded_requests_run_together() {
        let count = 16;
        // Every request waits for all others, so this only finishes if none are queued.
        let barrier = Arc::new(Barrier::new(count));
        let results = run_all(descriptors(count), move |_| {
            let barrier = Arc::clone(&barrier);
            async move {
                barrier.wait().await;
                ProbeResult::ok(200, BTreeMap::new())
            }
        })
        .await;
        assert_eq!(results.len(), count);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn bounded_requests_respect_the_limit() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (current, highest) = (Arc::clone(&in_flight), Arc::clone(&peak));
        let results = Aggregator::new()
            .with_max_in_flight(Some(3))
            .run_all(descriptors(30), move |_| {
                let (current, highest) = (Arc::clone(&current), Arc::clone(&highest));
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    highest.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    ProbeResult::ok(200, BTreeMap::new())
                }
            })
            .await;

        assert_eq!(results.len(), 30);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn zero_limit_is_unbounded() {
        let unbounded = Aggregator::new().with_max_in_flight(Some(0));
        assert_eq!(unbounded.max_in_flight(), None);
        let bounded = Aggregator::new().with_max_in_flight(Some(8));
        assert_eq!(bounded.max_in_flight(), Some(8));
    }

    #[test]
    fn seeding_flags_repeated_pairs() {
        let _ = env_logger::builder().is_test(true).try_init();
        let pair = RequestDescriptor::new("ns", "client", "server");
        let other = RequestDescriptor::new("ns", "client-2", "server");
        let batch = vec![pair.clone(), other.clone(), pair.clone(), pair.clone()];

        let (seeded, duplicates) = seed(&batch);
        assert_eq!(duplicates, 2);
        assert_eq!(seeded.len(), 2);
        assert_eq!(seeded.result(&pair), Some(&ProbeResult::default()));
        assert_eq!(seeded.result(&other), Some(&ProbeResult::default()));

        let (_, duplicates) = seed(&descriptors(10));
        assert_eq!(duplicates, 0);
    }

    #[tokio::test]
    async fn empty_batch() {
        let results = run_all(Vec::new(), |_| async { ProbeResult::default() }).await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn failures_are_reported_in_the_map() {
        let ok = RequestDescriptor::new("ns", "client", "reachable");
        let blocked = RequestDescriptor::new("ns", "client", "blocked");
        let results = run_all(vec![ok.clone(), blocked.clone()], |d| async move {
            if d.destination == "blocked" {
                ProbeResult::failed("exit code 28: operation timed out")
            } else {
                ProbeResult::ok(200, BTreeMap::new())
            }
        })
        .await;
        assert!(results.result(&ok).unwrap().is_success());
        let failure = results.result(&blocked).unwrap();
        assert_eq!(failure.status_code, 0);
        assert!(failure.error.is_some());
        assert_eq!(results.failures().len(), 1);
    }

    #[tokio::test]
    #[should_panic(expected = "issue panicked")]
    async fn panics_reach_the_caller() {
        run_all(descriptors(3), |d| async move {
            if index_of(&d) == 1 {
                panic!("issue panicked");
            }
            ProbeResult::default()
        })
        .await;
    }
}
