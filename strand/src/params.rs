use std::any::Any;
use std::sync::Arc;

use dashmap::DashMap;

/// Key into a [`Params`] bag.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ParamKey(pub &'static str);

impl std::fmt::Display for ParamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

/// Type-erased value stored in a [`Params`] bag.
pub type ParamValue = Arc<dyn Any + Send + Sync>;

/// Byte size of each read buffer. Default 1024.
pub const PARAM_READ_BUFFER_SIZE: ParamKey = ParamKey("read_buffer_size");
/// Per-read deadline in milliseconds. Default 1000; 0 disables.
pub const PARAM_READ_TIMEOUT: ParamKey = ParamKey("read_timeout_ms");
/// Per-write deadline in milliseconds. Default 100; 0 disables.
pub const PARAM_WRITE_TIMEOUT: ParamKey = ParamKey("write_timeout_ms");
/// Capacity of the per-channel outbound write queue. Default 64.
pub const PARAM_WRITE_QUEUE_CAPACITY: ParamKey = ParamKey("write_queue_capacity");

/// Concurrent key→value map attached to bootstraps, pipelines and channels.
///
/// Holds both recognized configuration (see the `PARAM_*` keys) and opaque
/// per-channel state. Safe for concurrent readers and writers; iteration
/// order is unspecified. Its lifetime is its owner's lifetime.
#[derive(Default)]
pub struct Params {
    map: DashMap<ParamKey, ParamValue>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `key`, replacing any previous value.
    pub fn store(&self, key: ParamKey, value: impl Any + Send + Sync) {
        self.map.insert(key, Arc::new(value));
    }

    /// Stores an already type-erased value. Used when copying one bag into
    /// another, e.g. bootstrap params into a channel.
    pub fn store_value(&self, key: ParamKey, value: ParamValue) {
        self.map.insert(key, value);
    }

    pub fn load(&self, key: ParamKey) -> Option<ParamValue> {
        self.map.get(&key).map(|entry| entry.value().clone())
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Visits every entry until `f` returns `false`.
    ///
    /// Iterates over a snapshot, so `f` may freely store into the same bag.
    pub fn range(&self, mut f: impl FnMut(ParamKey, &ParamValue) -> bool) {
        let snapshot: Vec<(ParamKey, ParamValue)> = self
            .map
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        for (key, value) in snapshot {
            if !f(key, &value) {
                break;
            }
        }
    }

    /// Typed lookup with a default, for `usize`-valued configuration.
    pub fn usize_or(&self, key: ParamKey, default: usize) -> usize {
        self.load(key)
            .and_then(|v| v.downcast_ref::<usize>().copied())
            .unwrap_or(default)
    }

    /// Typed lookup with a default, for `u64`-valued configuration.
    pub fn u64_or(&self, key: ParamKey, default: u64) -> u64 {
        self.load(key)
            .and_then(|v| v.downcast_ref::<u64>().copied())
            .unwrap_or(default)
    }

    /// Typed lookup with a default, for `bool`-valued configuration.
    pub fn bool_or(&self, key: ParamKey, default: bool) -> bool {
        self.load(key)
            .and_then(|v| v.downcast_ref::<bool>().copied())
            .unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn store_and_typed_load() {
        let params = Params::new();
        params.store(PARAM_READ_BUFFER_SIZE, 2048usize);
        params.store(PARAM_READ_TIMEOUT, 250u64);

        assert_eq!(params.usize_or(PARAM_READ_BUFFER_SIZE, 1024), 2048);
        assert_eq!(params.u64_or(PARAM_READ_TIMEOUT, 1000), 250);
        assert_eq!(params.u64_or(PARAM_WRITE_TIMEOUT, 100), 100);
    }

    #[test]
    fn range_visits_every_entry() {
        let params = Params::new();
        params.store(ParamKey("a"), 1usize);
        params.store(ParamKey("b"), 2usize);
        params.store(ParamKey("c"), 3usize);

        let mut seen = 0;
        params.range(|_, _| {
            seen += 1;
            true
        });
        assert_eq!(seen, 3);

        let mut stopped_after = 0;
        params.range(|_, _| {
            stopped_after += 1;
            false
        });
        assert_eq!(stopped_after, 1);
    }

    #[test]
    fn concurrent_store_and_load() {
        let params = Arc::new(Params::new());
        let writers: Vec<_> = (0..4)
            .map(|i| {
                let params = params.clone();
                thread::spawn(move || {
                    for j in 0..100usize {
                        params.store(PARAM_READ_BUFFER_SIZE, i * 100 + j);
                        let _ = params.load(PARAM_READ_BUFFER_SIZE);
                    }
                })
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }
        assert!(params.load(PARAM_READ_BUFFER_SIZE).is_some());
    }
}
