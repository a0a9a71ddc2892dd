//! A queue of pending timed commands, integrated with suspension on I/O readiness.
//!
//! The wheel is the single point of suspension for a relay instance: the server waits on
//!  it with a readiness future for its sockets, and either a due timer command or the I/O
//!  outcome comes back. Due commands are handed out one at a time and are removed from the
//!  wheel *before* being returned, so the dispatcher is free to re-register them.

use rustc_hash::FxHashMap;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::time::Duration;
use tokio::time::{self, Instant};

use crate::RelayError;

/// Identifier of a registered timer. Monotonically allocated and never reused while the
///  timer it names is live, including across counter wrap-around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u32);

/// Outcome of a [`TimerWheel::wait`] call.
#[derive(Debug)]
pub enum Waited<C, T> {
    /// a timer came due; its command has been removed from the wheel
    Timer(C),
    /// the supplied I/O future completed
    Io(T),
    /// nothing to wait for: no timers registered and no I/O future supplied
    Idle,
}

#[derive(PartialEq, Eq)]
struct HeapEntry {
    deadline: Instant,
    id: TimerId,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: invert so the earliest deadline surfaces first, with
        //  the allocation order breaking ties between equal deadlines
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.0.cmp(&self.id.0))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub struct TimerWheel<C> {
    heap: BinaryHeap<HeapEntry>,
    /// commands of live timers; cancellation removes the entry here and leaves a tombstone
    ///  in the heap that is skipped on pop
    live: FxHashMap<TimerId, C>,
    next_id: u32,
}

impl<C> TimerWheel<C> {
    pub fn new() -> TimerWheel<C> {
        TimerWheel {
            heap: BinaryHeap::new(),
            live: FxHashMap::default(),
            next_id: 1,
        }
    }

    /// Registers `cmd` to come due `delay` from now against the monotonic clock.
    pub fn register(&mut self, cmd: C, delay: Duration) -> TimerId {
        let id = self.alloc_id();
        self.heap.push(HeapEntry {
            deadline: Instant::now() + delay,
            id,
        });
        self.live.insert(id, cmd);
        id
    }

    fn alloc_id(&mut self) -> TimerId {
        loop {
            let id = TimerId(self.next_id);
            self.next_id = self.next_id.wrapping_add(1);
            if !self.live.contains_key(&id) {
                return id;
            }
        }
    }

    /// Cancels a registered timer. An unknown id is a caller bug and surfaces as
    ///  [`RelayError::NoSuchTimer`].
    pub fn cancel(&mut self, id: TimerId) -> Result<(), RelayError> {
        match self.live.remove(&id) {
            Some(_) => Ok(()),
            None => Err(RelayError::NoSuchTimer(id)),
        }
    }

    /// Removes and returns the earliest command whose deadline has passed, if any.
    pub fn pop_due(&mut self, now: Instant) -> Option<C> {
        while let Some(top) = self.heap.peek() {
            if !self.live.contains_key(&top.id) {
                self.heap.pop();
                continue;
            }
            if top.deadline > now {
                return None;
            }
            let entry = self.heap.pop().expect("peeked heap entry vanished");
            return self.live.remove(&entry.id);
        }
        None
    }

    /// Deadline of the earliest live timer.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(top) = self.heap.peek() {
            if self.live.contains_key(&top.id) {
                return Some(top.deadline);
            }
            self.heap.pop();
        }
        None
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Suspends until a timer comes due or the supplied I/O future completes, whichever is
    ///  first. Due timers win ties against ready I/O so that drop deadlines and the send
    ///  cadence are served before network events. A timer wake-up that finds only
    ///  cancelled tombstones recomputes the deadline and keeps waiting on the same I/O
    ///  future.
    ///
    /// With no timers registered and no I/O future supplied this returns
    ///  [`Waited::Idle`] immediately.
    pub async fn wait<F, T>(&mut self, io: Option<F>) -> Waited<C, T>
    where
        F: Future<Output = T>,
    {
        if let Some(cmd) = self.pop_due(Instant::now()) {
            return Waited::Timer(cmd);
        }

        let Some(io) = io else {
            loop {
                match self.next_deadline() {
                    None => return Waited::Idle,
                    Some(deadline) => {
                        time::sleep_until(deadline).await;
                        if let Some(cmd) = self.pop_due(Instant::now()) {
                            return Waited::Timer(cmd);
                        }
                    }
                }
            }
        };

        tokio::pin!(io);
        loop {
            match self.next_deadline() {
                None => return Waited::Io(io.as_mut().await),
                Some(deadline) => {
                    tokio::select! {
                        biased;
                        _ = time::sleep_until(deadline) => {
                            if let Some(cmd) = self.pop_due(Instant::now()) {
                                return Waited::Timer(cmd);
                            }
                        }
                        out = io.as_mut() => return Waited::Io(out),
                    }
                }
            }
        }
    }
}

impl<C> Default for TimerWheel<C> {
    fn default() -> Self {
        TimerWheel::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future;

    /// a `wait` with no I/O future, with the turbofish noise hidden away
    async fn wait_timers_only(wheel: &mut TimerWheel<u32>) -> Waited<u32, ()> {
        wheel.wait(None::<future::Pending<()>>).await
    }

    fn assert_timer(waited: Waited<u32, ()>, expected: u32) {
        match waited {
            Waited::Timer(cmd) => assert_eq!(cmd, expected),
            other => panic!("expected timer {}, got {:?}", expected, other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_in_deadline_order() {
        let mut wheel = TimerWheel::new();
        wheel.register(2, Duration::from_millis(100));
        wheel.register(1, Duration::from_millis(50));
        wheel.register(3, Duration::from_millis(150));

        let start = Instant::now();
        assert_timer(wait_timers_only(&mut wheel).await, 1);
        assert_eq!(start.elapsed(), Duration::from_millis(50));
        assert_timer(wait_timers_only(&mut wheel).await, 2);
        assert_eq!(start.elapsed(), Duration::from_millis(100));
        assert_timer(wait_timers_only(&mut wheel).await, 3);
        assert_eq!(start.elapsed(), Duration::from_millis(150));
        assert!(wheel.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_equal_deadlines_fire_in_registration_order() {
        let mut wheel = TimerWheel::new();
        for cmd in [1, 2, 3] {
            wheel.register(cmd, Duration::from_millis(10));
        }

        assert_timer(wait_timers_only(&mut wheel).await, 1);
        assert_timer(wait_timers_only(&mut wheel).await, 2);
        assert_timer(wait_timers_only(&mut wheel).await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_fires() {
        let mut wheel = TimerWheel::new();
        let cancelled = wheel.register(1, Duration::from_millis(100));
        wheel.register(2, Duration::from_millis(200));
        wheel.cancel(cancelled).unwrap();

        let start = Instant::now();
        assert_timer(wait_timers_only(&mut wheel).await, 2);
        assert_eq!(start.elapsed(), Duration::from_millis(200));
        assert!(wheel.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_unknown_id_is_an_error() {
        let mut wheel: TimerWheel<u32> = TimerWheel::new();
        let id = wheel.register(1, Duration::from_millis(10));
        wheel.cancel(id).unwrap();

        assert!(matches!(wheel.cancel(id), Err(RelayError::NoSuchTimer(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_without_timers_or_io_is_idle() {
        let mut wheel: TimerWheel<u32> = TimerWheel::new();
        assert!(matches!(wait_timers_only(&mut wheel).await, Waited::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn test_due_timer_wins_over_ready_io() {
        let mut wheel = TimerWheel::new();
        wheel.register(7, Duration::ZERO);

        match wheel.wait(Some(future::ready(42))).await {
            Waited::Timer(cmd) => assert_eq!(cmd, 7),
            other => panic!("expected the due timer, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_io_wins_over_pending_timer() {
        let mut wheel = TimerWheel::new();
        wheel.register(7, Duration::from_millis(100));

        match wheel.wait(Some(future::ready(42))).await {
            Waited::Io(out) => assert_eq!(out, 42),
            other => panic!("expected the I/O outcome, got {:?}", other),
        }
        assert_eq!(wheel.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_io_future_survives_tombstone_wakeups() {
        let mut wheel = TimerWheel::new();
        let cancelled = wheel.register(1, Duration::from_millis(10));
        wheel.cancel(cancelled).unwrap();

        // the heap still holds the tombstone; wait must skip it and fall through to I/O
        match wheel.wait(Some(time::sleep(Duration::from_millis(50)))).await {
            Waited::Io(()) => {}
            other => panic!("expected the I/O outcome, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatcher_may_re_register() {
        let mut wheel = TimerWheel::new();
        wheel.register(1, Duration::from_millis(20));

        let start = Instant::now();
        assert_timer(wait_timers_only(&mut wheel).await, 1);
        wheel.register(1, Duration::from_millis(20));
        assert_timer(wait_timers_only(&mut wheel).await, 1);
        assert_eq!(start.elapsed(), Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_ids_are_unique_across_wrap() {
        let mut wheel = TimerWheel::new();
        wheel.next_id = u32::MAX;
        let a = wheel.register(1, Duration::from_secs(10));
        let b = wheel.register(2, Duration::from_secs(10));
        let c = wheel.register(3, Duration::from_secs(10));

        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
        assert_eq!(wheel.len(), 3);
    }
}
