// src/recording/pacer.rs
//! Pointer-move throttling

/// Admits at most one pointer move per `interval_ms` of capture time.
///
/// Only pointer movement goes through the pacer; clicks and every other
/// state-affecting event bypass it.
#[derive(Debug, Clone)]
pub struct PointerPacer {
    interval_ms: i64,
    last_admitted: Option<i64>,
}

impl PointerPacer {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms: interval_ms as i64,
            last_admitted: None,
        }
    }

    pub fn admit(&mut self, timestamp_ms: i64) -> bool {
        match self.last_admitted {
            Some(last) if timestamp_ms >= last && timestamp_ms - last < self.interval_ms => false,
            _ => {
                self.last_admitted = Some(timestamp_ms);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttles_within_window() {
        let mut pacer = PointerPacer::new(50);
        assert!(pacer.admit(1_000));
        assert!(!pacer.admit(1_010));
        assert!(!pacer.admit(1_049));
        assert!(pacer.admit(1_050));
        assert!(!pacer.admit(1_060));
    }

    #[test]
    fn test_zero_interval_admits_everything() {
        let mut pacer = PointerPacer::new(0);
        assert!(pacer.admit(5));
        assert!(pacer.admit(5));
    }

    #[test]
    fn test_clock_step_back_resets_window() {
        let mut pacer = PointerPacer::new(50);
        assert!(pacer.admit(1_000));
        assert!(pacer.admit(900));
    }
}
