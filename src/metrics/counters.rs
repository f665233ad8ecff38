//! Monotonic counters.
//!
//! Counters only go up while a run is in progress. `reset` is reserved for
//! run start and is not exposed outside the crate.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing counter.
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    value: AtomicU64,
}

impl Counter {
    /// Create a new counter.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            value: AtomicU64::new(0),
        }
    }

    /// Get the counter name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Increment the counter by 1.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::AcqRel);
    }

    /// Increment the counter by `n`.
    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::AcqRel);
    }

    /// Get the current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    pub(crate) fn reset(&self) {
        self.value.store(0, Ordering::Release);
    }
}

/// A family of counters keyed by `N` label values.
///
/// Label sets are created on first increment. An empty family means nothing
/// was ever counted.
#[derive(Debug)]
pub struct LabeledCounter<const N: usize> {
    name: &'static str,
    label_names: [&'static str; N],
    counters: RwLock<BTreeMap<[String; N], AtomicU64>>,
}

impl<const N: usize> LabeledCounter<N> {
    /// Create a new labeled counter family.
    pub fn new(name: &'static str, label_names: [&'static str; N]) -> Self {
        Self {
            name,
            label_names,
            counters: RwLock::new(BTreeMap::new()),
        }
    }

    /// Get the family name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Get the label names.
    pub fn label_names(&self) -> &[&'static str; N] {
        &self.label_names
    }

    /// Increment the counter for `labels` by 1.
    pub fn inc(&self, labels: [&str; N]) {
        self.inc_by(labels, 1);
    }

    /// Increment the counter for `labels` by `n`.
    pub fn inc_by(&self, labels: [&str; N], n: u64) {
        let key: [String; N] = labels.map(str::to_string);
        {
            let counters = self.counters.read();
            if let Some(counter) = counters.get(&key) {
                counter.fetch_add(n, Ordering::AcqRel);
                return;
            }
        }
        self.counters
            .write()
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(n, Ordering::AcqRel);
    }

    /// Get the value for `labels`, zero if never incremented.
    pub fn get(&self, labels: [&str; N]) -> u64 {
        let key: [String; N] = labels.map(str::to_string);
        self.counters
            .read()
            .get(&key)
            .map(|c| c.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Sum over every label set.
    pub fn total(&self) -> u64 {
        self.counters
            .read()
            .values()
            .map(|c| c.load(Ordering::Acquire))
            .sum()
    }

    /// All label sets with their values, in label order.
    pub fn get_all(&self) -> Vec<([String; N], u64)> {
        self.counters
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Acquire)))
            .collect()
    }

    /// Whether nothing has been counted.
    pub fn is_empty(&self) -> bool {
        self.counters.read().is_empty()
    }

    pub(crate) fn reset(&self) {
        self.counters.write().clear();
    }
}

impl LabeledCounter<1> {
    /// Values keyed by the single label.
    pub fn to_map(&self) -> BTreeMap<String, u64> {
        self.get_all()
            .into_iter()
            .map(|([label], value)| (label, value))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new("attempted_resolves");
        assert_eq!(counter.get(), 0);

        counter.inc();
        counter.inc_by(4);
        assert_eq!(counter.get(), 5);

        counter.reset();
        assert_eq!(counter.get(), 0);
    }

    #[test]
    fn test_labeled_counter() {
        let retries = LabeledCounter::<2>::new("shard_retries", ["shard", "category"]);
        assert!(retries.is_empty());

        retries.inc(["ks/-80", "stale_master"]);
        retries.inc(["ks/-80", "stale_master"]);
        retries.inc_by(["ks/80-", "topology_unavailable"], 3);

        assert_eq!(retries.get(["ks/-80", "stale_master"]), 2);
        assert_eq!(retries.get(["ks/80-", "stale_master"]), 0);
        assert_eq!(retries.total(), 5);
        assert_eq!(retries.get_all().len(), 2);
    }

    #[test]
    fn test_single_label_map() {
        let retries = LabeledCounter::<1>::new("retry_count", ["category"]);
        retries.inc(["stale_master"]);
        let map = retries.to_map();
        assert_eq!(map.get("stale_master"), Some(&1));
    }
}
