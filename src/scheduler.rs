use crate::util::lock;
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, trace};

pub type TimerCallback = Arc<dyn Fn(Instant) + Send + Sync>;

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
struct TimeoutId(u64);

struct Node {
    callback: TimerCallback,
    armed_at: Option<Instant>,
}

struct SchedulerInner {
    /// time-ordered queue; the id makes entries for the same tick unique
    queue: BTreeSet<(Instant, TimeoutId)>,
    nodes: FxHashMap<TimeoutId, Node>,
    next_id: u64,
    last_processed: Instant,
    /// number of `process` calls currently firing timers
    num_processing: usize,
}

impl SchedulerInner {
    fn unarm(&mut self, id: TimeoutId) -> Option<Instant> {
        let armed_at = self.nodes.get_mut(&id)?.armed_at.take()?;
        self.queue.remove(&(armed_at, id));
        Some(armed_at)
    }
}

enum Clock {
    System,
    Manual(Mutex<Instant>),
}

/// The timer queue that drives all protocol timers. There is one scheduler per service, and it
///  is the authoritative source of the current time for the protocol engine.
///
/// Timers are represented by [Timeout] handles. A handle is bound to a callback once when it is
///  allocated, and it can then be (re-)armed any number of times. Dropping the handle frees its
///  entry.
///
/// Timer times are rounded up to ticks of [Scheduler::TICK], and never earlier than the last
///  processed time: a timer scheduled in the past fires at the next call to `process`. A timer
///  that is armed for a due time while `process` is firing timers is moved to the next tick, so
///  a callback re-arming itself for 'now' can not keep a pass from terminating.
pub struct Scheduler {
    epoch: Instant,
    clock: Clock,
    inner: Mutex<SchedulerInner>,
    wakeup: Notify,
}
impl Debug for Scheduler {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let inner = lock(&self.inner);
        write!(f, "Scheduler{{{} timers, {} armed}}", inner.nodes.len(), inner.queue.len())
    }
}

impl Scheduler {
    pub const TICK: Duration = Duration::from_millis(10);

    /// scheduler using tokio's clock
    pub fn new() -> Arc<Scheduler> {
        Self::with_clock(Clock::System, Instant::now())
    }

    /// scheduler with a clock that only moves through [Scheduler::advance], for deterministic
    ///  tests and simulations
    pub fn with_manual_clock(start: Instant) -> Arc<Scheduler> {
        Self::with_clock(Clock::Manual(Mutex::new(start)), start)
    }

    fn with_clock(clock: Clock, epoch: Instant) -> Arc<Scheduler> {
        Arc::new(Scheduler {
            epoch,
            clock,
            inner: Mutex::new(SchedulerInner {
                queue: BTreeSet::default(),
                nodes: FxHashMap::default(),
                next_id: 0,
                last_processed: epoch,
                num_processing: 0,
            }),
            wakeup: Notify::new(),
        })
    }

    pub fn now(&self) -> Instant {
        match &self.clock {
            Clock::System => Instant::now(),
            Clock::Manual(now) => *lock(now),
        }
    }

    /// Moves a manual clock forward and processes all timers that became due. This is a no-op
    ///  for the system clock.
    pub fn advance(&self, by: Duration) -> Option<Instant> {
        let now = match &self.clock {
            Clock::System => return self.next_wakeup(),
            Clock::Manual(now) => {
                let mut now = lock(now);
                *now += by;
                *now
            }
        };
        self.process(now)
    }

    fn round_to_tick(&self, when: Instant) -> Instant {
        let tick_nanos = Self::TICK.as_nanos();
        let offset = when.saturating_duration_since(self.epoch).as_nanos();
        let num_ticks = offset.div_ceil(tick_nanos);
        self.epoch + Duration::from_nanos((num_ticks * tick_nanos) as u64)
    }

    /// Binds a new [Timeout] handle to a callback. The handle is not armed.
    pub fn allocate(self: &Arc<Self>, callback: impl Fn(Instant) + Send + Sync + 'static) -> Timeout {
        let mut inner = lock(&self.inner);
        let id = TimeoutId(inner.next_id);
        inner.next_id += 1;
        inner.nodes.insert(id, Node {
            callback: Arc::new(callback),
            armed_at: None,
        });

        Timeout {
            id,
            scheduler: Arc::downgrade(self),
        }
    }

    /// (Re-)arms a timeout, replacing a previously armed time
    pub fn schedule(&self, timeout: &Timeout, when: Instant) {
        self.do_schedule(timeout.id, when, false);
    }

    /// Arms a timeout unless it is already armed for an earlier (or the same) time
    pub fn schedule_no_later(&self, timeout: &Timeout, when: Instant) {
        self.do_schedule(timeout.id, when, true);
    }

    fn do_schedule(&self, id: TimeoutId, when: Instant, keep_earlier: bool) {
        let mut inner = lock(&self.inner);
        let mut when = self.round_to_tick(when).max(inner.last_processed);
        if inner.num_processing > 0 && when <= inner.last_processed {
            when = inner.last_processed + Self::TICK;
        }

        let prev = match inner.nodes.get(&id) {
            None => {
                debug!("scheduling a timeout that was freed - ignoring");
                return;
            }
            Some(node) => node.armed_at,
        };
        if keep_earlier {
            if let Some(prev) = prev {
                if prev <= when {
                    return;
                }
            }
        }

        inner.unarm(id);
        inner.queue.insert((when, id));
        if let Some(node) = inner.nodes.get_mut(&id) {
            node.armed_at = Some(when);
        }

        let is_new_minimum = inner.queue.first()
            .map(|&(_, first_id)| first_id == id)
            .unwrap_or(false);
        drop(inner);

        if is_new_minimum {
            trace!("new earliest timer at {:?} - waking up scheduler loop", when);
            self.wakeup.notify_one();
        }
    }

    pub fn scheduled_at(&self, timeout: &Timeout) -> Option<Instant> {
        lock(&self.inner).nodes.get(&timeout.id)?.armed_at
    }

    /// disarms a timeout without freeing it
    pub fn cancel(&self, timeout: &Timeout) {
        lock(&self.inner).unarm(timeout.id);
    }

    /// idempotently removes a timeout's entry, armed or not
    fn free(&self, id: TimeoutId) {
        let mut inner = lock(&self.inner);
        inner.unarm(id);
        inner.nodes.remove(&id);
    }

    pub fn next_wakeup(&self) -> Option<Instant> {
        lock(&self.inner).queue.first()
            .map(|&(when, _)| when)
    }

    pub fn num_armed(&self) -> usize {
        lock(&self.inner).queue.len()
    }

    /// Fires all timers that are due at `now`, in time order. The internal lock is released while
    ///  a callback runs, so callbacks can (re-)schedule timers.
    ///
    /// Returns the time of the next armed timer, if any.
    pub fn process(&self, now: Instant) -> Option<Instant> {
        let mut inner = lock(&self.inner);
        if now > inner.last_processed {
            inner.last_processed = now;
        }
        inner.num_processing += 1;

        let next = loop {
            let (when, id) = match inner.queue.first() {
                Some(&(when, id)) if when <= now => (when, id),
                Some(&(when, _)) => break Some(when),
                None => break None,
            };
            inner.queue.remove(&(when, id));

            let callback = match inner.nodes.get_mut(&id) {
                Some(node) => {
                    node.armed_at = None;
                    node.callback.clone()
                }
                None => continue,
            };
            drop(inner);

            trace!("firing timer {:?} scheduled for {:?}", id, when);
            callback(now);

            inner = lock(&self.inner);
        };

        inner.num_processing -= 1;
        next
    }

    /// The loop driving the scheduler with tokio's clock. This runs until the surrounding task
    ///  is aborted.
    pub async fn run(self: Arc<Self>) {
        info!("starting scheduler loop");
        loop {
            let notified = self.wakeup.notified();
            match self.process(self.now()) {
                Some(when) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(when) => {}
                        _ = notified => {}
                    }
                }
                None => notified.await,
            }
        }
    }
}

/// Handle for a timer. Dropping the handle frees the scheduler's entry.
pub struct Timeout {
    id: TimeoutId,
    scheduler: Weak<Scheduler>,
}
impl Debug for Timeout {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Timeout{{{}}}", self.id.0)
    }
}

impl Timeout {
    pub fn schedule(&self, when: Instant) {
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.schedule(self, when);
        }
    }

    pub fn schedule_no_later(&self, when: Instant) {
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.schedule_no_later(self, when);
        }
    }

    pub fn cancel(&self) {
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.cancel(self);
        }
    }

    pub fn scheduled_at(&self) -> Option<Instant> {
        self.scheduler.upgrade()?
            .scheduled_at(self)
    }
}

impl Drop for Timeout {
    fn drop(&mut self) {
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.free(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recording(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> impl Fn(Instant) + Send + Sync + 'static {
        let log = log.clone();
        move |_| log.lock().unwrap().push(name)
    }

    #[test]
    fn test_fires_in_time_order() {
        let start = Instant::now();
        let scheduler = Scheduler::with_manual_clock(start);
        let log = Arc::new(Mutex::new(Vec::new()));

        let a = scheduler.allocate(recording(&log, "a"));
        let b = scheduler.allocate(recording(&log, "b"));
        let c = scheduler.allocate(recording(&log, "c"));
        a.schedule(start + Duration::from_millis(30));
        b.schedule(start + Duration::from_millis(10));
        c.schedule(start + Duration::from_millis(20));

        assert_eq!(scheduler.advance(Duration::from_millis(5)), Some(start + Duration::from_millis(10)));
        assert!(log.lock().unwrap().is_empty());

        assert_eq!(scheduler.advance(Duration::from_millis(20)), Some(start + Duration::from_millis(30)));
        assert_eq!(*log.lock().unwrap(), vec!["b", "c"]);

        assert_eq!(scheduler.advance(Duration::from_millis(100)), None);
        assert_eq!(*log.lock().unwrap(), vec!["b", "c", "a"]);
    }

    #[rstest]
    #[case::exact(20, 20)]
    #[case::round_up(21, 30)]
    #[case::just_above_zero(1, 10)]
    #[case::zero(0, 0)]
    fn test_round_to_tick(#[case] millis: u64, #[case] expected_millis: u64) {
        let start = Instant::now();
        let scheduler = Scheduler::with_manual_clock(start);
        let timeout = scheduler.allocate(|_| {});
        timeout.schedule(start + Duration::from_millis(millis));
        assert_eq!(timeout.scheduled_at(), Some(start + Duration::from_millis(expected_millis)));
    }

    #[test]
    fn test_past_time_is_not_before_last_processed() {
        let start = Instant::now();
        let scheduler = Scheduler::with_manual_clock(start);
        scheduler.advance(Duration::from_millis(100));

        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = counter.clone();
        let timeout = scheduler.allocate(move |_| { counter2.fetch_add(1, Ordering::SeqCst); });
        timeout.schedule(start);
        assert_eq!(timeout.scheduled_at(), Some(start + Duration::from_millis(100)));

        scheduler.advance(Duration::ZERO);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[rstest]
    #[case::at_now(0)]
    #[case::in_the_past(50)]
    fn test_rearming_for_due_time_waits_for_next_tick(#[case] millis_before_now: u64) {
        let start = Instant::now();
        let scheduler = Scheduler::with_manual_clock(start);
        scheduler.advance(Duration::from_millis(100));

        let counter = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<Timeout>>> = Default::default();
        let counter2 = counter.clone();
        let slot2 = slot.clone();
        let timeout = scheduler.allocate(move |now| {
            counter2.fetch_add(1, Ordering::SeqCst);
            if let Some(timeout) = slot2.lock().unwrap().as_ref() {
                timeout.schedule(now - Duration::from_millis(millis_before_now));
            }
        });
        timeout.schedule(start + Duration::from_millis(100));
        *slot.lock().unwrap() = Some(timeout);

        let now = start + Duration::from_millis(100);
        assert_eq!(scheduler.process(now), Some(now + Scheduler::TICK));
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        assert_eq!(scheduler.advance(Scheduler::TICK), Some(now + 2 * Scheduler::TICK));
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        slot.lock().unwrap().take();
        assert_eq!(scheduler.num_armed(), 0);
    }

    #[test]
    fn test_reschedule_replaces() {
        let start = Instant::now();
        let scheduler = Scheduler::with_manual_clock(start);
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = scheduler.allocate(recording(&log, "a"));

        a.schedule(start + Duration::from_millis(10));
        a.schedule(start + Duration::from_millis(50));
        assert_eq!(scheduler.num_armed(), 1);

        scheduler.advance(Duration::from_millis(20));
        assert!(log.lock().unwrap().is_empty());
        scheduler.advance(Duration::from_millis(30));
        assert_eq!(*log.lock().unwrap(), vec!["a"]);
    }

    #[rstest]
    #[case::earlier_wins(50, 20, 20)]
    #[case::later_is_ignored(20, 50, 20)]
    fn test_schedule_no_later(#[case] first: u64, #[case] second: u64, #[case] expected: u64) {
        let start = Instant::now();
        let scheduler = Scheduler::with_manual_clock(start);
        let timeout = scheduler.allocate(|_| {});
        timeout.schedule_no_later(start + Duration::from_millis(first));
        timeout.schedule_no_later(start + Duration::from_millis(second));
        assert_eq!(timeout.scheduled_at(), Some(start + Duration::from_millis(expected)));
    }

    #[test]
    fn test_drop_frees_entry() {
        let start = Instant::now();
        let scheduler = Scheduler::with_manual_clock(start);
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = scheduler.allocate(recording(&log, "a"));
        a.schedule(start + Duration::from_millis(10));
        drop(a);

        assert_eq!(scheduler.num_armed(), 0);
        assert_eq!(scheduler.advance(Duration::from_millis(20)), None);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_cancel_keeps_allocation() {
        let start = Instant::now();
        let scheduler = Scheduler::with_manual_clock(start);
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = scheduler.allocate(recording(&log, "a"));
        a.schedule(start + Duration::from_millis(10));
        a.cancel();
        scheduler.advance(Duration::from_millis(20));
        assert!(log.lock().unwrap().is_empty());

        a.schedule(start + Duration::from_millis(30));
        scheduler.advance(Duration::from_millis(20));
        assert_eq!(*log.lock().unwrap(), vec!["a"]);
    }

    #[test]
    fn test_callback_can_reschedule_other_timers() {
        let start = Instant::now();
        let scheduler = Scheduler::with_manual_clock(start);
        let log = Arc::new(Mutex::new(Vec::new()));

        let b = Arc::new(scheduler.allocate(recording(&log, "b")));
        let b2 = b.clone();
        let log2 = log.clone();
        let a = scheduler.allocate(move |now| {
            log2.lock().unwrap().push("a");
            b2.schedule(now + Duration::from_millis(10));
        });
        a.schedule(start + Duration::from_millis(10));

        assert_eq!(scheduler.advance(Duration::from_millis(10)), Some(start + Duration::from_millis(20)));
        assert_eq!(*log.lock().unwrap(), vec!["a"]);
        assert_eq!(scheduler.advance(Duration::from_millis(10)), None);
        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_scheduling_freed_timeout_is_ignored() {
        let start = Instant::now();
        let scheduler = Scheduler::with_manual_clock(start);
        let timeout = scheduler.allocate(|_| {});
        scheduler.free(timeout.id);
        scheduler.free(timeout.id);
        timeout.schedule(start);
        assert_eq!(scheduler.num_armed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_wakes_up_for_new_timer() {
        let scheduler = Scheduler::new();
        let driver = tokio::spawn(scheduler.clone().run());

        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = counter.clone();
        let timeout = scheduler.allocate(move |_| { counter2.fetch_add(1, Ordering::SeqCst); });

        tokio::time::sleep(Duration::from_millis(5)).await;
        timeout.schedule(scheduler.now() + Duration::from_millis(50));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        driver.abort();
    }
}
