//! In-memory service registry with round-robin instance selection.
//!
//! Each service name maps to an immutable snapshot of its instance list plus a
//! rotation cursor. Refreshes swap the snapshot wholesale through `ArcSwap`, so
//! concurrent readers never observe a partially updated list and `select` never
//! blocks. A snapshot is only swapped when the serialized instance list changes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use shopmesh_core::ServiceInstance;

/// Immutable instance list plus the fingerprint of its serialized form.
#[derive(Debug)]
struct Snapshot {
    instances: Vec<ServiceInstance>,
    fingerprint: blake3::Hash,
}

impl Snapshot {
    fn new(instances: Vec<ServiceInstance>) -> Self {
        let fingerprint = fingerprint(&instances);
        Self {
            instances,
            fingerprint,
        }
    }
}

fn fingerprint(instances: &[ServiceInstance]) -> blake3::Hash {
    // Serializing a Vec of plain structs cannot fail.
    let bytes = serde_json::to_vec(instances).unwrap_or_default();
    blake3::hash(&bytes)
}

/// Registry entry for one service.
#[derive(Debug)]
struct ServiceEntry {
    snapshot: ArcSwap<Snapshot>,
    /// Always `< len` after a selection on a non-empty list.
    cursor: AtomicUsize,
}

impl ServiceEntry {
    fn empty() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(Snapshot::new(Vec::new())),
            cursor: AtomicUsize::new(0),
        }
    }
}

/// Result of offering a freshly discovered list to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplaceOutcome {
    /// Identical serialized list; the entry was left untouched.
    Unchanged,
    /// The list changed and was swapped in.
    Replaced { previous: usize, current: usize },
    /// A previously non-empty list became empty.
    Cleared { previous: usize },
}

/// Per-process registry of service instances, owned by its composition root.
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    entries: DashMap<String, Arc<ServiceEntry>>,
    /// Bumped on every swap; lets caches detect stale targets cheaply.
    epoch: AtomicU64,
}

impl InstanceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with an empty entry for every statically known name.
    #[must_use]
    pub fn with_services<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let registry = Self::new();
        for name in names {
            registry.ensure(name.into());
        }
        registry
    }

    /// Starts tracking `name` with an empty list if it is not known yet.
    pub fn track(&self, name: &str) {
        if !self.entries.contains_key(name) {
            self.ensure(name.to_string());
        }
    }

    fn ensure(&self, name: String) -> Arc<ServiceEntry> {
        self.entries
            .entry(name)
            .or_insert_with(|| Arc::new(ServiceEntry::empty()))
            .clone()
    }

    fn entry(&self, name: &str) -> Option<Arc<ServiceEntry>> {
        self.entries.get(name).map(|e| Arc::clone(e.value()))
    }

    /// Statically known service names, sorted.
    #[must_use]
    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Offers a newly discovered instance list for `name`.
    pub fn replace(&self, name: &str, instances: Vec<ServiceInstance>) -> ReplaceOutcome {
        let entry = self.ensure(name.to_string());
        let current = entry.snapshot.load();
        let next = Snapshot::new(instances);
        if next.fingerprint == current.fingerprint {
            return ReplaceOutcome::Unchanged;
        }

        let previous = current.instances.len();
        let count = next.instances.len();
        entry.snapshot.store(Arc::new(next));
        self.epoch.fetch_add(1, Ordering::AcqRel);

        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!("registry_instances", "service" => name.to_string()).set(count as f64);

        if count == 0 {
            ReplaceOutcome::Cleared { previous }
        } else {
            ReplaceOutcome::Replaced {
                previous,
                current: count,
            }
        }
    }

    /// Next instance of `name` in round-robin order, or `None` when unavailable.
    ///
    /// If the list shrank since the last call the stale cursor is reduced
    /// modulo the new length.
    #[must_use]
    pub fn select(&self, name: &str) -> Option<ServiceInstance> {
        let entry = self.entry(name)?;
        let snapshot = entry.snapshot.load();
        let len = snapshot.instances.len();
        if len == 0 {
            return None;
        }
        let prev = entry
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some((c % len + 1) % len))
            .unwrap_or_else(|c| c);
        snapshot.instances.get(prev % len).cloned()
    }

    /// Current instances of `name` (empty when unknown).
    #[must_use]
    pub fn instances(&self, name: &str) -> Vec<ServiceInstance> {
        self.entry(name)
            .map(|e| e.snapshot.load().instances.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn has_instances(&self, name: &str) -> bool {
        self.entry(name)
            .is_some_and(|e| !e.snapshot.load().instances.is_empty())
    }

    /// Whether `target` is currently listed for `name`.
    #[must_use]
    pub fn contains(&self, name: &str, target: &ServiceInstance) -> bool {
        self.entry(name)
            .is_some_and(|e| e.snapshot.load().instances.contains(target))
    }

    /// Instance count per known service, for health reporting.
    #[must_use]
    pub fn instance_counts(&self) -> BTreeMap<String, usize> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value().snapshot.load().instances.len()))
            .collect()
    }

    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }
}
