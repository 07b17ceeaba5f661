//! One-shot and periodic timers, drained once per event-loop iteration.
//! The earliest expiry bounds the demultiplexer wait.

use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;

/// Wall clock in milliseconds, the loop's time base.
pub fn now_ms() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as u64,
        Err(_) => 0,
    }
}

pub type TimerCallback = Box<dyn FnMut(u64)>;

struct Timer {
    id: u64,
    fire_at: u64,
    interval_ms: u64,
    oneshot: bool,
    cb: TimerCallback,
}

/// Unordered timer list; scans are cheap at the handful of timers a worker
/// carries.
#[derive(Default)]
pub struct TimerList {
    timers: Vec<Timer>,
    next_id: u64,
}

impl TimerList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules a callback `interval_ms` from `now`. Periodic timers
    /// reschedule themselves after each run.
    pub fn add(&mut self, interval_ms: u64, oneshot: bool, now: u64, cb: TimerCallback) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        // A zero-interval periodic timer would never let the loop advance.
        let interval_ms = if oneshot { interval_ms } else { interval_ms.max(1) };
        self.timers.push(Timer {
            id,
            fire_at: now + interval_ms,
            interval_ms,
            oneshot,
            cb,
        });
        id
    }

    pub fn remove(&mut self, id: u64) -> bool {
        let before = self.timers.len();
        self.timers.retain(|t| t.id != id);
        before != self.timers.len()
    }

    /// Milliseconds until the earliest expiry, zero when overdue, `None`
    /// when nothing is scheduled.
    pub fn next_run(&self, now: u64) -> Option<u64> {
        self.timers
            .iter()
            .map(|t| t.fire_at.saturating_sub(now))
            .min()
    }

    /// Fires every due timer once.
    pub fn run(&mut self, now: u64) {
        let mut idx = 0;
        while idx < self.timers.len() {
            if self.timers[idx].fire_at > now {
                idx += 1;
                continue;
            }
            let mut timer = self.timers.swap_remove(idx);
            (timer.cb)(now);
            if !timer.oneshot {
                timer.fire_at = now + timer.interval_ms;
                self.timers.push(timer);
            } else {
                debug!("oneshot timer {} retired", timer.id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    pub fn clear(&mut self) {
        self.timers.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    #[test]
    fn next_run_reports_earliest_deadline() {
        let mut timers = TimerList::new();
        assert_eq!(timers.next_run(1000), None);

        timers.add(500, true, 1000, Box::new(|_| {}));
        timers.add(200, true, 1000, Box::new(|_| {}));
        assert_eq!(timers.next_run(1000), Some(200));
        assert_eq!(timers.next_run(1150), Some(50));
        // Overdue clamps at zero instead of underflowing.
        assert_eq!(timers.next_run(5000), Some(0));
    }

    #[test]
    fn oneshot_fires_once_and_periodic_reschedules() {
        let fired = Rc::new(RefCell::new(Vec::new()));
        let mut timers = TimerList::new();

        let log = Rc::clone(&fired);
        timers.add(100, true, 0, Box::new(move |now| log.borrow_mut().push(("once", now))));
        let log = Rc::clone(&fired);
        timers.add(250, false, 0, Box::new(move |now| log.borrow_mut().push(("tick", now))));

        timers.run(50);
        assert!(fired.borrow().is_empty());

        timers.run(100);
        assert_eq!(fired.borrow().as_slice(), &[("once", 100)]);
        assert_eq!(timers.len(), 1);

        timers.run(250);
        timers.run(500);
        assert_eq!(
            fired.borrow().as_slice(),
            &[("once", 100), ("tick", 250), ("tick", 500)]
        );
    }

    #[test]
    fn remove_cancels_a_scheduled_timer() {
        let mut timers = TimerList::new();
        let id = timers.add(100, true, 0, Box::new(|_| panic!("cancelled timer fired")));
        assert!(timers.remove(id));
        assert!(!timers.remove(id));
        timers.run(1000);
        assert!(timers.is_empty());
    }
}
