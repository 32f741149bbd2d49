use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use bson::Bson;
use serde::{Deserialize, Serialize};

/// Hybrid logical time: wall-clock seconds plus a counter within the second.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp {
    pub secs: u32,
    pub inc: u32,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp { secs: 0, inc: 0 };
    pub const MAX: Timestamp = Timestamp {
        secs: u32::MAX,
        inc: u32::MAX,
    };

    pub fn new(secs: u32, inc: u32) -> Self {
        Self { secs, inc }
    }

    pub fn as_u64(self) -> u64 {
        ((self.secs as u64) << 32) | self.inc as u64
    }

    pub fn from_u64(v: u64) -> Self {
        Self {
            secs: (v >> 32) as u32,
            inc: v as u32,
        }
    }

    /// The instant just before this one.
    pub fn prev(self) -> Self {
        Self::from_u64(self.as_u64().saturating_sub(1))
    }

    pub fn to_bson(self) -> Bson {
        Bson::Timestamp(bson::Timestamp {
            time: self.secs,
            increment: self.inc,
        })
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({}, {})", self.secs, self.inc)
    }
}

fn wall_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Cluster-wide logical clock. Every tick is unique and strictly greater
/// than any earlier tick or observed time.
#[derive(Debug)]
pub struct LogicalClock {
    packed: AtomicU64,
}

impl Default for LogicalClock {
    fn default() -> Self {
        Self::new()
    }
}

impl LogicalClock {
    pub fn new() -> Self {
        Self {
            packed: AtomicU64::new(Timestamp::new(wall_secs(), 0).as_u64()),
        }
    }

    pub fn now(&self) -> Timestamp {
        Timestamp::from_u64(self.packed.load(Ordering::SeqCst))
    }

    pub fn tick(&self) -> Timestamp {
        let wall = wall_secs();
        let mut current = self.packed.load(Ordering::SeqCst);
        loop {
            let cur = Timestamp::from_u64(current);
            let next = if wall > cur.secs {
                Timestamp::new(wall, 1)
            } else {
                Timestamp::from_u64(current + 1)
            };
            match self.packed.compare_exchange(
                current,
                next.as_u64(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    /// Move forward to at least `ts`.
    pub fn advance(&self, ts: Timestamp) {
        self.packed.fetch_max(ts.as_u64(), Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn ticks_are_unique_and_increasing() {
        let clock = Arc::new(LogicalClock::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let clock = clock.clone();
                thread::spawn(move || (0..1000).map(|_| clock.tick()).collect::<Vec<_>>())
            })
            .collect();
        let mut all = Vec::new();
        for h in handles {
            let ticks = h.join().unwrap();
            assert!(ticks.windows(2).all(|w| w[0] < w[1]));
            all.extend(ticks);
        }
        let n = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), n);
    }

    #[test]
    fn advance_never_moves_backwards() {
        let clock = LogicalClock::new();
        let t = clock.tick();
        clock.advance(Timestamp::ZERO);
        assert_eq!(clock.now(), t);
        let future = Timestamp::new(t.secs + 100, 5);
        clock.advance(future);
        assert!(clock.tick() > future);
    }
}
