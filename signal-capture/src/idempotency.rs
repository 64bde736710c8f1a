//! Deduplication of signals by `event_id`.
//!
//! Clients retry on timeouts and network errors, so the same signal can reach us several
//! times. We keep a bounded history of the event ids that were successfully handed to the
//! sink, and answer `Duplicate` for any id seen within the retention window. Ids older than
//! the window, or pushed out by the capacity bound, look fresh again: this gives at-most-once
//! delivery per id within the window, not global exactly-once.
use std::collections::{HashMap, HashSet, VecDeque};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use metrics::gauge;
use rand::Rng;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::health::HealthHandle;
use crate::prometheus::{report_window_evictions, WINDOW_ENTRIES};
use crate::time::TimeSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowConfig {
    pub retention: Duration,
    pub max_entries: NonZeroUsize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(10 * 60),
            max_entries: NonZeroUsize::new(100_000).unwrap_or(NonZeroUsize::MIN),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    // insertion sequence, tells live entries apart from stale slots in the queue
    seq: u64,
    observed_at: OffsetDateTime,
}

/// Recently recorded event ids, evicted by age or oldest-first past the capacity bound.
///
/// Not synchronized: [`IdempotencyGuard`] owns it behind a mutex.
#[derive(Debug)]
pub struct RecentEventWindow {
    entries: HashMap<String, WindowEntry>,
    insertion_order: VecDeque<(u64, String)>,
    next_seq: u64,
    retention: time::Duration,
    max_entries: usize,
}

impl RecentEventWindow {
    pub fn new(config: WindowConfig) -> Self {
        Self {
            entries: HashMap::new(),
            insertion_order: VecDeque::new(),
            next_seq: 0,
            retention: time::Duration::try_from(config.retention).unwrap_or(time::Duration::MAX),
            max_entries: config.max_entries.get(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True if the id was recorded and has not expired yet at `now`.
    pub fn contains(&self, event_id: &str, now: OffsetDateTime) -> bool {
        self.entries
            .get(event_id)
            .is_some_and(|entry| !self.is_expired(entry, now))
    }

    /// Records the id, then evicts oldest-inserted entries until the window is back
    /// within its capacity. Returns the number of entries evicted for capacity.
    pub fn insert(&mut self, event_id: String, observed_at: OffsetDateTime) -> usize {
        let seq = self.next_seq;
        self.next_seq += 1;

        self.entries
            .insert(event_id.clone(), WindowEntry { seq, observed_at });
        self.insertion_order.push_back((seq, event_id));

        let mut evicted = 0;
        while self.entries.len() > self.max_entries {
            let Some((seq, event_id)) = self.insertion_order.pop_front() else {
                break;
            };
            if self.is_live_slot(seq, &event_id) {
                self.entries.remove(&event_id);
                evicted += 1;
            }
        }
        evicted
    }

    /// Drops entries older than the retention duration. Returns how many were removed.
    pub fn evict_expired(&mut self, now: OffsetDateTime) -> usize {
        let mut evicted = 0;
        while let Some((seq, event_id)) = self.insertion_order.front() {
            // a slot whose id was evicted or re-recorded since is stale, just drop it
            let live = self
                .entries
                .get(event_id)
                .filter(|entry| entry.seq == *seq)
                .copied();
            if let Some(entry) = live {
                if !self.is_expired(&entry, now) {
                    break;
                }
                self.entries.remove(event_id);
                evicted += 1;
            }
            self.insertion_order.pop_front();
        }
        evicted
    }

    fn is_live_slot(&self, seq: u64, event_id: &str) -> bool {
        self.entries
            .get(event_id)
            .is_some_and(|entry| entry.seq == seq)
    }

    fn is_expired(&self, entry: &WindowEntry, now: OffsetDateTime) -> bool {
        now - entry.observed_at >= self.retention
    }
}

/// Returned by [`IdempotencyGuard::check_and_record`] for an id that was not seen before.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fresh;

/// The id was recorded within the retention window, or is currently being dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Duplicate;

#[derive(Debug)]
struct GuardState {
    window: RecentEventWindow,
    // ids reserved by an in-flight dispatch, not recorded yet
    pending: HashSet<String>,
}

fn lock(state: &Mutex<GuardState>) -> MutexGuard<'_, GuardState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Thread-safe owner of the [`RecentEventWindow`].
///
/// Cloning the guard shares the same window.
#[derive(Clone, Debug)]
pub struct IdempotencyGuard {
    state: Arc<Mutex<GuardState>>,
}

impl IdempotencyGuard {
    pub fn new(config: WindowConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(GuardState {
                window: RecentEventWindow::new(config),
                pending: HashSet::new(),
            })),
        }
    }

    /// Atomically checks the id and claims it for the caller.
    ///
    /// The id is only recorded in the window when the returned [`Reservation`] is
    /// committed, which callers do once the sink accepted the signal. Until then, any
    /// concurrent check for the same id is answered `Duplicate`. Dropping the reservation
    /// without committing releases the id.
    pub fn check_and_reserve(
        &self,
        event_id: &str,
        observed_at: OffsetDateTime,
    ) -> Result<Reservation, Duplicate> {
        let mut state = lock(&self.state);

        let expired = state.window.evict_expired(observed_at);
        report_window_evictions("expired", expired);

        if state.pending.contains(event_id) || state.window.contains(event_id, observed_at) {
            return Err(Duplicate);
        }
        state.pending.insert(event_id.to_owned());

        Ok(Reservation {
            state: self.state.clone(),
            event_id: event_id.to_owned(),
            observed_at,
            committed: false,
        })
    }

    /// Checks the id and records it right away.
    pub fn check_and_record(
        &self,
        event_id: &str,
        observed_at: OffsetDateTime,
    ) -> Result<Fresh, Duplicate> {
        self.check_and_reserve(event_id, observed_at)?.commit();
        Ok(Fresh)
    }

    pub fn contains(&self, event_id: &str, now: OffsetDateTime) -> bool {
        lock(&self.state).window.contains(event_id, now)
    }

    pub fn len(&self) -> usize {
        lock(&self.state).window.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.state).window.is_empty()
    }

    pub fn evict_expired(&self, now: OffsetDateTime) -> usize {
        let mut state = lock(&self.state);
        let expired = state.window.evict_expired(now);
        report_window_evictions("expired", expired);
        gauge!(WINDOW_ENTRIES).set(state.window.len() as f64);
        expired
    }

    /// Sweeps expired entries on a fixed period, so that memory is reclaimed even when
    /// no traffic comes in. Needs to be spawned in a separate task, returns on cancellation.
    pub async fn sweep_expired(
        &self,
        timesource: Arc<dyn TimeSource + Send + Sync>,
        period: Duration,
        liveness: HealthHandle,
        shutdown: CancellationToken,
    ) {
        // Jitter the period a bit, to not have all replicas sweeping at the same time
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..1000));
        let mut interval = tokio::time::interval(period + jitter);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = interval.tick() => {}
            }

            let expired = self.evict_expired(timesource.current_time());
            debug!(expired, "swept idempotency window");
            liveness.report_healthy();
        }
    }
}

/// A claim on an event id, held while its signal is being dispatched.
#[must_use = "an uncommitted reservation is released when dropped"]
#[derive(Debug)]
pub struct Reservation {
    state: Arc<Mutex<GuardState>>,
    event_id: String,
    observed_at: OffsetDateTime,
    committed: bool,
}

impl Reservation {
    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    /// Records the id in the window, with the time it was first observed.
    pub fn commit(mut self) {
        let mut state = lock(&self.state);
        state.pending.remove(&self.event_id);
        let evicted = state
            .window
            .insert(self.event_id.clone(), self.observed_at);
        report_window_evictions("capacity", evicted);
        gauge!(WINDOW_ENTRIES).set(state.window.len() as f64);
        drop(state);

        self.committed = true;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.committed {
            lock(&self.state).pending.remove(&self.event_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    fn at(seconds: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000 + seconds).unwrap()
    }

    fn guard(retention_secs: u64, max_entries: usize) -> IdempotencyGuard {
        IdempotencyGuard::new(WindowConfig {
            retention: Duration::from_secs(retention_secs),
            max_entries: NonZeroUsize::new(max_entries).unwrap(),
        })
    }

    #[test]
    fn second_check_within_retention_is_duplicate() {
        let guard = guard(600, 10);

        assert_eq!(guard.check_and_record("e1", at(0)), Ok(Fresh));
        assert_eq!(guard.check_and_record("e1", at(599)), Err(Duplicate));
        assert_eq!(guard.check_and_record("e2", at(599)), Ok(Fresh));
    }

    #[test]
    fn first_seen_wins() {
        let guard = guard(600, 10);

        assert_eq!(guard.check_and_record("e1", at(0)), Ok(Fresh));
        // a duplicate does not push the expiry back
        assert_eq!(guard.check_and_record("e1", at(500)), Err(Duplicate));
        assert_eq!(guard.check_and_record("e1", at(600)), Ok(Fresh));
    }

    #[test]
    fn expired_entries_are_swept() {
        let guard = guard(60, 10);

        guard.check_and_record("e1", at(0)).unwrap();
        guard.check_and_record("e2", at(30)).unwrap();
        assert_eq!(guard.len(), 2);

        assert_eq!(guard.evict_expired(at(61)), 1);
        assert_eq!(guard.len(), 1);
        assert!(!guard.contains("e1", at(61)));
        assert!(guard.contains("e2", at(61)));

        assert_eq!(guard.evict_expired(at(90)), 1);
        assert!(guard.is_empty());
    }

    #[test]
    fn capacity_evicts_oldest_first() {
        let max_entries = 100;
        let guard = guard(600, max_entries);

        for i in 0..=max_entries {
            assert_eq!(guard.check_and_record(&format!("e{i}"), at(0)), Ok(Fresh));
        }

        assert_eq!(guard.len(), max_entries);
        assert!(!guard.contains("e0", at(0)));
        assert!(guard.contains("e1", at(0)));
        assert!(guard.contains(&format!("e{max_entries}"), at(0)));

        // the evicted id looks fresh again
        assert_eq!(guard.check_and_record("e0", at(1)), Ok(Fresh));
        assert!(!guard.contains("e1", at(1)));
    }

    #[test]
    fn smallest_window_still_deduplicates() {
        let guard = guard(600, 1);

        assert_eq!(guard.check_and_record("e1", at(0)), Ok(Fresh));
        assert_eq!(guard.check_and_record("e1", at(1)), Err(Duplicate));

        assert_eq!(guard.check_and_record("e2", at(2)), Ok(Fresh));
        assert_eq!(guard.len(), 1);
        assert_eq!(guard.check_and_record("e2", at(3)), Err(Duplicate));
    }

    #[test]
    fn rerecorded_ids_do_not_confuse_eviction() {
        let mut window = RecentEventWindow::new(WindowConfig {
            retention: Duration::from_secs(10),
            max_entries: NonZeroUsize::new(2).unwrap(),
        });

        window.insert("a".to_string(), at(0));
        // "a" expired and is recorded again, its first slot in the queue is now stale
        window.insert("a".to_string(), at(20));
        window.insert("b".to_string(), at(21));
        assert_eq!(window.len(), 2);

        assert_eq!(window.insert("c".to_string(), at(22)), 1);
        assert!(!window.contains("a", at(22)));
        assert!(window.contains("b", at(22)));
        assert!(window.contains("c", at(22)));

        assert_eq!(window.evict_expired(at(40)), 2);
        assert!(window.is_empty());
    }

    #[test]
    fn pending_reservation_blocks_concurrent_checks() {
        let guard = guard(600, 10);

        let reservation = guard.check_and_reserve("e1", at(0)).unwrap();
        assert_eq!(reservation.event_id(), "e1");
        assert!(guard.check_and_reserve("e1", at(1)).is_err());
        // not recorded until committed
        assert!(!guard.contains("e1", at(1)));

        reservation.commit();
        assert!(guard.contains("e1", at(1)));
        assert!(guard.check_and_reserve("e1", at(2)).is_err());
    }

    #[test]
    fn dropped_reservation_is_released() {
        let guard = guard(600, 10);

        let reservation = guard.check_and_reserve("e1", at(0)).unwrap();
        drop(reservation);

        assert!(!guard.contains("e1", at(1)));
        assert_eq!(guard.check_and_record("e1", at(1)), Ok(Fresh));
    }

    #[test]
    fn concurrent_checks_admit_exactly_one() {
        let guard = guard(600, 1000);
        let threads = 16;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let guard = guard.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    guard.check_and_record("same", at(0)).is_ok()
                })
            })
            .collect();

        let fresh = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|fresh| *fresh)
            .count();
        assert_eq!(fresh, 1);
        assert_eq!(guard.len(), 1);
    }

    #[tokio::test]
    async fn sweeper_stops_on_shutdown() {
        use crate::health::HealthRegistry;
        use crate::time::SystemTime;

        let guard = guard(1, 10);
        guard
            .check_and_record("e1", OffsetDateTime::now_utc() - Duration::from_secs(5))
            .unwrap();

        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("idempotency_window".to_string(), Duration::from_secs(30));
        let shutdown = CancellationToken::new();

        let sweeper = {
            let guard = guard.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                guard
                    .sweep_expired(
                        Arc::new(SystemTime {}),
                        Duration::from_millis(10),
                        handle,
                        shutdown,
                    )
                    .await
            })
        };

        // the first tick fires immediately
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(guard.is_empty());
        assert!(registry.get_status().healthy);

        shutdown.cancel();
        sweeper.await.unwrap();
    }
}
