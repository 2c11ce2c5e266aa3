//! Timer wheel: periodic callbacks with a per-timer interval, serviced
//! by the interrupt worker's tick (`spec.md` §4.1: "timer tick → for
//! each registered timer, if `now - last >= interval` call its handler
//! and set `last = now`").
//!
//! Used for the ARP cache's 1 s sweep and the TCP retransmit timer's
//! 1 s sweep; both register here rather than spawning their own thread.

use std::sync::Mutex;
use std::time::{Duration, Instant};

struct TimerEntry {
    name: &'static str,
    interval: Duration,
    last: Instant,
    handler: Box<dyn Fn() + Send>,
}

/// A set of named periodic callbacks, ticked from the interrupt worker.
pub struct TimerWheel {
    timers: Mutex<Vec<TimerEntry>>,
}

impl TimerWheel {
    pub fn new() -> Self {
        TimerWheel {
            timers: Mutex::new(Vec::new()),
        }
    }

    /// Register a callback to run at most once per `interval`, starting
    /// one interval from now.
    pub fn register(&self, name: &'static str, interval: Duration, handler: impl Fn() + Send + 'static) {
        self.timers.lock().unwrap().push(TimerEntry {
            name,
            interval,
            last: Instant::now(),
            handler: Box::new(handler),
        });
    }

    /// Called once per interrupt-worker tick; fires any timer whose
    /// interval has elapsed since it last fired.
    pub fn tick(&self) {
        let now = Instant::now();
        let mut timers = self.timers.lock().unwrap();
        for entry in timers.iter_mut() {
            if now.duration_since(entry.last) >= entry.interval {
                entry.last = now;
                (entry.handler)();
            }
        }
    }

    #[cfg(test)]
    fn names(&self) -> Vec<&'static str> {
        self.timers.lock().unwrap().iter().map(|e| e.name).collect()
    }
}

impl Default for TimerWheel {
    fn default() -> Self {
        TimerWheel::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn fires_after_interval_elapses() {
        let wheel = TimerWheel::new();
        let count = Arc::new(AtomicU32::new(0));
        let c2 = count.clone();
        wheel.register("test", Duration::from_millis(10), move || {
            c2.fetch_add(1, Ordering::SeqCst);
        });
        wheel.tick();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        std::thread::sleep(Duration::from_millis(15));
        wheel.tick();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn registration_is_named() {
        let wheel = TimerWheel::new();
        wheel.register("arp-sweep", Duration::from_secs(1), || {});
        assert_eq!(wheel.names(), vec!["arp-sweep"]);
    }
}
