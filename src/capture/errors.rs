use crate::core::{ChangeKind, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// A forwarding failure that was kept away from the originating write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureError {
    pub rule: String,
    pub kind: ChangeKind,
    pub key: Option<Value>,
    pub error: String,
    pub recorded_at: DateTime<Utc>,
}

/// Bounded, shared log of suppressed forwarding errors.
///
/// The oldest entry is evicted once `capacity` is reached; `dropped` counts
/// evictions so an operator can tell the log overflowed.
#[derive(Clone)]
pub struct CaptureErrorChannel {
    inner: Arc<Mutex<ErrorRing>>,
}

struct ErrorRing {
    entries: VecDeque<CaptureError>,
    capacity: usize,
    dropped: u64,
}

impl CaptureErrorChannel {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ErrorRing {
                entries: VecDeque::new(),
                capacity: capacity.max(1),
                dropped: 0,
            })),
        }
    }

    pub fn record(&self, error: CaptureError) {
        // A poisoned ring still holds valid entries.
        let mut ring = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if ring.entries.len() == ring.capacity {
            ring.entries.pop_front();
            ring.dropped += 1;
        }
        ring.entries.push_back(error);
    }

    pub fn snapshot(&self) -> Vec<CaptureError> {
        match self.inner.lock() {
            Ok(ring) => ring.entries.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().entries.iter().cloned().collect(),
        }
    }

    /// Removes and returns every recorded error.
    pub fn drain(&self) -> Vec<CaptureError> {
        match self.inner.lock() {
            Ok(mut ring) => ring.entries.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().entries.drain(..).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        match self.inner.lock() {
            Ok(ring) => ring.dropped,
            Err(poisoned) => poisoned.into_inner().dropped,
        }
    }
}

impl Default for CaptureErrorChannel {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error(n: i64) -> CaptureError {
        CaptureError {
            rule: "r".into(),
            kind: ChangeKind::Insert,
            key: Some(Value::Integer(n)),
            error: "boom".into(),
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let channel = CaptureErrorChannel::new(2);
        for n in 1..=3 {
            channel.record(error(n));
        }
        let kept: Vec<_> = channel.snapshot().into_iter().map(|e| e.key).collect();
        assert_eq!(kept, vec![Some(Value::Integer(2)), Some(Value::Integer(3))]);
        assert_eq!(channel.dropped(), 1);
        assert_eq!(channel.drain().len(), 2);
        assert!(channel.is_empty());
    }
}
