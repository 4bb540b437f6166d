use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::marker::PhantomData;
use std::time::Instant;

type Callback<T> = Box<dyn FnOnce(&mut T) + Send>;

struct Timer<T> {
    deadline: Instant,
    seq: u64,
    callback: Callback<T>,
}

impl<T> PartialEq for Timer<T> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl<T> Eq for Timer<T> {}
impl<T> PartialOrd for Timer<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<T> Ord for Timer<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

/// Monotonic time source plus one-shot timers, executed on the I/O thread.
/// Backed by a min-heap ordered by `(deadline, insertion order)` so the
/// `select!` loop can always ask for "the next deadline" in O(log n).
///
/// Generic over `T` (the state a fired callback mutates) so this stays a
/// plain data structure rather than borrowing the Controller's owned state
/// itself — callers drain due timers and run each callback against their
/// own `&mut T`.
pub struct Scheduler<T> {
    heap: BinaryHeap<Reverse<Timer<T>>>,
    next_seq: u64,
    _marker: PhantomData<T>,
}

impl<T> Default for Scheduler<T> {
    fn default() -> Self {
        Scheduler {
            heap: BinaryHeap::new(),
            next_seq: 0,
            _marker: PhantomData,
        }
    }
}

impl<T> Scheduler<T> {
    pub fn new() -> Self {
        Scheduler::default()
    }

    pub fn now() -> Instant {
        Instant::now()
    }

    /// Arms a one-shot timer firing at `deadline`.
    pub fn alarm(&mut self, deadline: Instant, callback: Callback<T>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(Timer {
            deadline,
            seq,
            callback,
        }));
    }

    /// Arms a one-shot timer firing `delay` from now.
    pub fn defer(&mut self, delay: std::time::Duration, callback: Callback<T>) {
        self.alarm(Instant::now() + delay, callback);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(t)| t.deadline)
    }

    /// Pops and returns every timer whose deadline has passed, in deadline
    /// order.
    pub fn drain_due(&mut self, now: Instant) -> Vec<Callback<T>> {
        let mut due = Vec::new();
        while let Some(Reverse(timer)) = self.heap.peek() {
            if timer.deadline > now {
                break;
            }
            let Reverse(timer) = self.heap.pop().unwrap();
            due.push(timer.callback);
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn drains_due_timers_in_deadline_order() {
        let mut sched: Scheduler<()> = Scheduler::new();
        let base = Instant::now();
        let order = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));

        let o1 = order.clone();
        sched.alarm(
            base + Duration::from_millis(20),
            Box::new(move |_| o1.lock().unwrap().push(2)),
        );
        let o2 = order.clone();
        sched.alarm(
            base + Duration::from_millis(10),
            Box::new(move |_| o2.lock().unwrap().push(1)),
        );

        let due = sched.drain_due(base + Duration::from_millis(30));
        assert_eq!(due.len(), 2);
        assert!(sched.next_deadline().is_none());
    }

    #[test]
    fn next_deadline_reflects_earliest_pending_timer() {
        let mut sched: Scheduler<()> = Scheduler::new();
        let base = Instant::now();
        sched.alarm(base + Duration::from_secs(5), Box::new(|_| {}));
        sched.alarm(base + Duration::from_secs(1), Box::new(|_| {}));
        assert_eq!(sched.next_deadline(), Some(base + Duration::from_secs(1)));
    }
}
