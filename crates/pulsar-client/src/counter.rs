// Monotonic id counters.
use std::sync::atomic::{AtomicU64, Ordering};

/// Sentinel meaning "no request id". Brokers echo it on ERROR frames that
/// answer CONNECT, which carries no request id of its own.
pub const UNDEF_REQUEST_ID: u64 = u64::MAX;

/// Atomic counter handing out connection-scoped ids (request, producer,
/// consumer, sequence). `next` returns the pre-increment value, so the
/// first id issued equals the starting value.
#[derive(Debug, Default)]
pub struct MonotonicId(AtomicU64);

impl MonotonicId {
    pub fn new(start: u64) -> Self {
        Self(AtomicU64::new(start))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn starts_at_initial_value() {
        let id = MonotonicId::new(43);
        assert_eq!(id.next(), 43);
        assert_eq!(id.next(), 44);
    }

    #[test]
    fn concurrent_callers_see_distinct_increasing_ids() {
        let id = Arc::new(MonotonicId::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let id = Arc::clone(&id);
            handles.push(std::thread::spawn(move || {
                (0..1000).map(|_| id.next()).collect::<Vec<_>>()
            }));
        }
        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("join"))
            .collect();
        all.sort_unstable();
        let expected: Vec<u64> = (0..8000).collect();
        assert_eq!(all, expected);
    }
}
