use std::collections::HashMap;
use std::sync::Mutex;

use bson::Document;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailPointMode {
    Off,
    AlwaysOn,
    /// Fire on the next `n` evaluations, then turn off.
    Times(u32),
}

#[derive(Debug, Clone)]
struct FailPoint {
    mode: FailPointMode,
    data: Document,
    hits: u64,
}

/// Named fault-injection points consulted at protocol steps.
#[derive(Debug, Default)]
pub struct FailPoints {
    points: Mutex<HashMap<String, FailPoint>>,
}

impl FailPoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn configure(&self, name: &str, mode: FailPointMode, data: Option<Document>) {
        info!(failpoint = name, mode = ?mode, "configuring failpoint");
        let mut points = self.points.lock().unwrap_or_else(|e| e.into_inner());
        if mode == FailPointMode::Off {
            points.remove(name);
            return;
        }
        points.insert(
            name.to_string(),
            FailPoint {
                mode,
                data: data.unwrap_or_default(),
                hits: 0,
            },
        );
    }

    /// Evaluate `name`; returns its data document when it fires.
    pub fn evaluate(&self, name: &str) -> Option<Document> {
        let mut points = self.points.lock().unwrap_or_else(|e| e.into_inner());
        let point = points.get_mut(name)?;
        let fire = match &mut point.mode {
            FailPointMode::Off => false,
            FailPointMode::AlwaysOn => true,
            FailPointMode::Times(n) if *n > 0 => {
                *n -= 1;
                true
            }
            FailPointMode::Times(_) => false,
        };
        if !fire {
            return None;
        }
        point.hits += 1;
        let data = point.data.clone();
        if point.mode == FailPointMode::Times(0) {
            points.remove(name);
        }
        Some(data)
    }

    pub fn should_fail(&self, name: &str) -> bool {
        self.evaluate(name).is_some()
    }

    pub fn hits(&self, name: &str) -> u64 {
        let points = self.points.lock().unwrap_or_else(|e| e.into_inner());
        points.get(name).map(|p| p.hits).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use bson::doc;

    use super::*;

    #[test]
    fn times_mode_fires_then_turns_off() {
        let fp = FailPoints::new();
        fp.configure("x", FailPointMode::Times(2), Some(doc! { "phase": "cloning" }));
        assert_eq!(fp.evaluate("x"), Some(doc! { "phase": "cloning" }));
        assert!(fp.should_fail("x"));
        assert!(!fp.should_fail("x"));
    }

    #[test]
    fn off_clears_always_on() {
        let fp = FailPoints::new();
        fp.configure("y", FailPointMode::AlwaysOn, None);
        assert!(fp.should_fail("y"));
        assert!(fp.should_fail("y"));
        assert_eq!(fp.hits("y"), 2);
        fp.configure("y", FailPointMode::Off, None);
        assert!(!fp.should_fail("y"));
    }
}
