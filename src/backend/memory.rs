use crate::backend::{
    AdmissionInput, AdmissionOutput, Backend, Clock, CounterStore, Decision, SystemClock,
};
use crate::policy::{PolicyName, RateLimitPolicy};
use actix_web::rt::task::JoinHandle;
use actix_web::ResponseError;
use dashmap::DashMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_GC_INTERVAL_SECONDS: u64 = 60 * 5;

type CounterMap = DashMap<(PolicyName, String), Counter>;

/// The in-memory store cannot fail.
#[derive(Debug)]
pub enum Error {}

impl Display for Error {
    fn fmt(&self, _: &mut Formatter<'_>) -> std::fmt::Result {
        match *self {}
    }
}

impl std::error::Error for Error {}

impl ResponseError for Error {}

/// A fixed window [Backend] that uses [DashMap] to keep counters in process memory.
///
/// Every process enforces its limits independently; when several instances serve the same
/// traffic the effective limit is multiplied by the instance count.
#[derive(Clone)]
pub struct InMemoryBackend {
    map: Arc<CounterMap>,
    clock: Arc<dyn Clock>,
    gc: Option<Arc<GcHandle>>,
}

struct Counter {
    count: u64,
    reset_time: u64,
}

// Stops the sweep once the last clone of the backend is gone.
struct GcHandle(JoinHandle<()>);

impl Drop for GcHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl InMemoryBackend {
    pub fn builder() -> InMemoryBackendBuilder {
        InMemoryBackendBuilder {
            gc_interval: Some(Duration::from_secs(DEFAULT_GC_INTERVAL_SECONDS)),
            clock: Arc::new(SystemClock),
        }
    }

    /// Count one request from `identifier` under `policy`.
    ///
    /// The window starts at the first request and is not sliding, so up to twice the limit
    /// can get through around a window boundary. Denied requests are not counted.
    pub fn is_allowed(
        &self,
        identifier: &str,
        policy: PolicyName,
        limit: &RateLimitPolicy,
    ) -> (Decision, AdmissionOutput) {
        let now = self.clock.now_ms();
        let max = limit.max_requests();
        let output = |remaining, reset_time| AdmissionOutput {
            limit: max,
            window: limit.window(),
            remaining,
            reset_time,
            checked_at: now,
        };

        // The entry holds the shard lock, so the check and increment are atomic per key.
        let mut entry = self
            .map
            .entry((policy, identifier.to_owned()))
            .or_insert_with(|| Counter {
                count: 0,
                reset_time: 0,
            });
        let counter = entry.value_mut();

        if now >= counter.reset_time {
            // New or expired: start a fresh window.
            counter.count = 1;
            counter.reset_time = now.saturating_add(limit.window_ms());
            (Decision::Allowed, output(max - 1, counter.reset_time))
        } else if counter.count >= max {
            (Decision::Denied, output(0, counter.reset_time))
        } else {
            counter.count += 1;
            (
                Decision::Allowed,
                output(max - counter.count, counter.reset_time),
            )
        }
    }

    /// Removes every counter whose reset time is strictly in the past.
    pub fn cleanup(&self) -> usize {
        sweep(&self.map, self.clock.now_ms())
    }

    pub fn remove(&self, policy: PolicyName, identifier: &str) {
        self.map.remove(&(policy, identifier.to_owned()));
    }

    /// Number of counters currently held, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn garbage_collector(
        map: Arc<CounterMap>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> JoinHandle<()> {
        assert!(
            interval.as_secs_f64() > 0f64,
            "GC interval must be non-zero"
        );
        actix_web::rt::spawn(async move {
            loop {
                let removed = sweep(&map, clock.now_ms());
                log::trace!("Rate limit sweep removed {removed} expired counters");
                actix_web::rt::time::sleep(interval).await;
            }
        })
    }
}

fn sweep(map: &CounterMap, now: u64) -> usize {
    let mut removed = 0;
    // A counter expiring exactly now is left alone, the next request replaces it anyway.
    map.retain(|_, counter| {
        let keep = counter.reset_time >= now;
        if !keep {
            removed += 1;
        }
        keep
    });
    removed
}

impl Backend<AdmissionInput> for InMemoryBackend {
    type Output = AdmissionOutput;
    type Error = Error;

    async fn request(
        &self,
        input: AdmissionInput,
    ) -> Result<(Decision, Self::Output), Self::Error> {
        Ok(self.is_allowed(&input.identifier, input.policy, &input.limit))
    }
}

impl CounterStore for InMemoryBackend {
    async fn remove_key(&self, policy: PolicyName, identifier: &str) -> Result<(), Self::Error> {
        self.remove(policy, identifier);
        Ok(())
    }

    async fn cleanup(&self) -> Result<usize, Self::Error> {
        Ok(InMemoryBackend::cleanup(self))
    }
}

pub struct InMemoryBackendBuilder {
    gc_interval: Option<Duration>,
    clock: Arc<dyn Clock>,
}

impl InMemoryBackendBuilder {
    /// Override the default garbage collector interval (5 minutes).
    ///
    /// Set to None to disable garbage collection.
    ///
    /// The garbage collector periodically scans the internal map, removing expired counters.
    /// It is spawned on the current actix runtime, so when enabled [build](Self::build) must
    /// be called from within one.
    pub fn with_gc_interval(mut self, interval: Option<Duration>) -> Self {
        self.gc_interval = interval;
        self
    }

    /// Override the time source, [SystemClock] by default.
    pub fn with_clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn build(self) -> InMemoryBackend {
        let map = Arc::new(CounterMap::new());
        let gc = self.gc_interval.map(|gc_interval| {
            Arc::new(GcHandle(InMemoryBackend::garbage_collector(
                map.clone(),
                self.clock.clone(),
                gc_interval,
            )))
        });
        InMemoryBackend {
            map,
            clock: self.clock,
            gc,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ManualClock;

    const MINUTE: Duration = Duration::from_secs(60);
    const START: u64 = 1_700_000_000_000;

    fn backend() -> (InMemoryBackend, ManualClock) {
        let clock = ManualClock::new(START);
        let backend = InMemoryBackend::builder()
            .with_gc_interval(None)
            .with_clock(clock.clone())
            .build();
        (backend, clock)
    }

    fn policy(window_ms: u64, max_requests: u64) -> RateLimitPolicy {
        RateLimitPolicy::new(Duration::from_millis(window_ms), max_requests).unwrap()
    }

    #[test]
    fn test_allow_deny() {
        let (backend, _) = backend();
        let limit = policy(60_000, 5);
        for _ in 0..5 {
            // First 5 should be allowed
            let (decision, _) = backend.is_allowed("u1", PolicyName::General, &limit);
            assert!(decision.is_allowed());
        }
        // Sixth should be denied
        let (decision, _) = backend.is_allowed("u1", PolicyName::General, &limit);
        assert!(decision.is_denied());
    }

    #[test]
    fn test_window_of_two() {
        let (backend, clock) = backend();
        let limit = policy(1000, 2);

        let (decision, output) = backend.is_allowed("u1", PolicyName::General, &limit);
        assert!(decision.is_allowed());
        assert_eq!(output.remaining, 1);
        assert_eq!(output.reset_time, START + 1000);

        clock.advance(Duration::from_millis(10));
        let (decision, output) = backend.is_allowed("u1", PolicyName::General, &limit);
        assert!(decision.is_allowed());
        assert_eq!(output.remaining, 0);
        // Window is fixed at the first request
        assert_eq!(output.reset_time, START + 1000);

        let (decision, output) = backend.is_allowed("u1", PolicyName::General, &limit);
        assert!(decision.is_denied());
        assert_eq!(output.remaining, 0);
        assert_eq!(output.reset_time, START + 1000);

        // Once the window has passed the counter starts again
        clock.set(START + 1500);
        let (decision, output) = backend.is_allowed("u1", PolicyName::General, &limit);
        assert!(decision.is_allowed());
        assert_eq!(output.remaining, 1);
        assert_eq!(output.reset_time, START + 2500);
    }

    #[test]
    fn test_reset_at_exact_boundary() {
        let (backend, clock) = backend();
        let limit = policy(1000, 1);
        backend.is_allowed("u1", PolicyName::General, &limit);
        clock.advance(Duration::from_millis(999));
        let (decision, _) = backend.is_allowed("u1", PolicyName::General, &limit);
        assert!(decision.is_denied());
        clock.advance(Duration::from_millis(1));
        let (decision, output) = backend.is_allowed("u1", PolicyName::General, &limit);
        assert!(decision.is_allowed());
        assert_eq!(output.reset_time, START + 2000);
    }

    #[test]
    fn test_denied_requests_are_not_counted() {
        let (backend, clock) = backend();
        let limit = policy(60_000, 1);
        backend.is_allowed("u1", PolicyName::General, &limit);
        clock.advance(Duration::from_secs(5));
        let (first, first_out) = backend.is_allowed("u1", PolicyName::General, &limit);
        clock.advance(Duration::from_secs(5));
        let (second, second_out) = backend.is_allowed("u1", PolicyName::General, &limit);
        assert!(first.is_denied() && second.is_denied());
        assert_eq!(first_out, second_out);
        assert_eq!(backend.map.get(&(PolicyName::General, "u1".to_string())).unwrap().count, 1);
    }

    #[test]
    fn test_authentication_countdown() {
        let (backend, _) = backend();
        let limit = policy(900_000, 10);
        for expected in (0..10).rev() {
            let (decision, output) =
                backend.is_allowed("ip:1.2.3.4", PolicyName::Authentication, &limit);
            assert!(decision.is_allowed());
            assert_eq!(output.remaining, expected);
            assert_eq!(output.limit, 10);
        }
        let (decision, output) =
            backend.is_allowed("ip:1.2.3.4", PolicyName::Authentication, &limit);
        assert!(decision.is_denied());
        assert_eq!(output.remaining, 0);
    }

    #[test]
    fn test_identifiers_are_independent() {
        let (backend, _) = backend();
        let limit = policy(60_000, 1);
        backend.is_allowed("a", PolicyName::General, &limit);
        let (decision, _) = backend.is_allowed("a", PolicyName::General, &limit);
        assert!(decision.is_denied());
        let (decision, output) = backend.is_allowed("b", PolicyName::General, &limit);
        assert!(decision.is_allowed());
        assert_eq!(output.remaining, 0);
    }

    #[test]
    fn test_policies_are_independent() {
        let (backend, _) = backend();
        let auth = policy(900_000, 2);
        let general = policy(3_600_000, 100);
        for _ in 0..2 {
            backend.is_allowed("ip:1.2.3.4", PolicyName::Authentication, &auth);
        }
        let (decision, _) = backend.is_allowed("ip:1.2.3.4", PolicyName::Authentication, &auth);
        assert!(decision.is_denied());
        let (decision, output) = backend.is_allowed("ip:1.2.3.4", PolicyName::General, &general);
        assert!(decision.is_allowed());
        assert_eq!(output.remaining, 99);
    }

    #[test]
    fn test_cleanup_only_removes_expired() {
        let (backend, clock) = backend();
        backend.is_allowed("short", PolicyName::General, &policy(1000, 5));
        backend.is_allowed("long", PolicyName::General, &policy(10_000, 5));
        backend.is_allowed("long", PolicyName::General, &policy(10_000, 5));

        // Expiring exactly now is not yet in the past
        clock.set(START + 1000);
        assert_eq!(backend.cleanup(), 0);
        assert_eq!(backend.len(), 2);

        clock.set(START + 1001);
        assert_eq!(backend.cleanup(), 1);
        assert!(!backend
            .map
            .contains_key(&(PolicyName::General, "short".to_string())));
        let long = backend
            .map
            .get(&(PolicyName::General, "long".to_string()))
            .unwrap();
        assert_eq!(long.count, 2);
        assert_eq!(long.reset_time, START + 10_000);
    }

    #[test]
    fn test_remove() {
        let (backend, _) = backend();
        let limit = policy(60_000, 1);
        backend.is_allowed("u1", PolicyName::Payment, &limit);
        let (decision, _) = backend.is_allowed("u1", PolicyName::Payment, &limit);
        assert!(decision.is_denied());
        backend.remove(PolicyName::Payment, "u1");
        // Counter should have been reset
        let (decision, _) = backend.is_allowed("u1", PolicyName::Payment, &limit);
        assert!(decision.is_allowed());
    }

    #[test]
    fn test_concurrent_requests_never_exceed_limit() {
        let (backend, _) = backend();
        let limit = policy(60_000, 50);
        let allowed = std::sync::atomic::AtomicU64::new(0);
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..25 {
                        let (decision, _) = backend.is_allowed("hot", PolicyName::General, &limit);
                        if decision.is_allowed() {
                            allowed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        }
                    }
                });
            }
        });
        assert_eq!(allowed.into_inner(), 50);
    }

    #[actix_web::test]
    async fn test_backend_request() {
        let (backend, _) = backend();
        let input = AdmissionInput::new(PolicyName::Payment, policy(60_000, 2), "user:42");
        let (decision, output) = backend.request(input.clone()).await.unwrap();
        assert!(decision.is_allowed());
        assert_eq!(output.limit, 2);
        assert_eq!(output.window, MINUTE);
        backend.request(input.clone()).await.unwrap();
        let (decision, _) = backend.request(input.clone()).await.unwrap();
        assert!(decision.is_denied());
        backend
            .remove_key(PolicyName::Payment, "user:42")
            .await
            .unwrap();
        let (decision, _) = backend.request(input).await.unwrap();
        assert!(decision.is_allowed());
    }

    #[actix_web::test]
    async fn test_garbage_collection() {
        tokio::time::pause();
        let clock = ManualClock::new(START);
        let backend = InMemoryBackend::builder()
            .with_gc_interval(Some(MINUTE))
            .with_clock(clock.clone())
            .build();
        backend.is_allowed("KEY1", PolicyName::General, &policy(60_000, 1));
        backend.is_allowed("KEY2", PolicyName::General, &policy(120_000, 1));
        assert_eq!(backend.len(), 2);
        // Advance time such that the garbage collector runs,
        // expired KEY1 should be cleaned, but KEY2 should remain.
        clock.advance(MINUTE + Duration::from_millis(1));
        tokio::time::advance(MINUTE).await;
        actix_web::rt::task::yield_now().await;
        assert!(!backend
            .map
            .contains_key(&(PolicyName::General, "KEY1".to_string())));
        assert!(backend
            .map
            .contains_key(&(PolicyName::General, "KEY2".to_string())));
    }

    #[actix_web::test]
    async fn test_gc_stops_with_last_clone() {
        let backend = InMemoryBackend::builder()
            .with_gc_interval(Some(MINUTE))
            .build();
        // The sweep task owns the other strong reference to the map
        let map = Arc::downgrade(&backend.map);
        let clone = backend.clone();

        drop(backend);
        for _ in 0..5 {
            actix_web::rt::task::yield_now().await;
        }
        assert_eq!(map.strong_count(), 2);
        assert!(!clone.gc.as_ref().unwrap().0.is_finished());

        drop(clone);
        for _ in 0..5 {
            actix_web::rt::task::yield_now().await;
        }
        assert!(map.upgrade().is_none());
    }
}
