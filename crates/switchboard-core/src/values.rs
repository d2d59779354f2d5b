//! Connection-scoped heterogeneous value store.

use std::any::Any;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

type Slot = Box<dyn Any + Send + Sync>;

/// String-keyed store of arbitrarily typed values.
///
/// Lives as long as one connection and is shared by every handler invocation
/// on it. Lookups are typed: asking for a key with the wrong type behaves
/// exactly like asking for a missing key.
#[derive(Default)]
pub struct Values {
    inner: DashMap<String, Slot>,
}

impl Values {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `key`. Returns `true` if a previous value was replaced.
    pub fn insert<T>(&self, key: impl Into<String>, value: T) -> bool
    where
        T: Send + Sync + 'static,
    {
        self.inner.insert(key.into(), Box::new(value)).is_some()
    }

    /// Clone out the value under `key` if present and of type `T`.
    pub fn get<T>(&self, key: &str) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.inner
            .get(key)
            .and_then(|slot| slot.downcast_ref::<T>().cloned())
    }

    /// Return the existing value, or store and return the one built by `init`.
    ///
    /// Returns `None` when the key already holds a value of another type.
    pub fn get_or_insert_with<T, F>(&self, key: impl Into<String>, init: F) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        match self.inner.entry(key.into()) {
            Entry::Occupied(entry) => entry.get().downcast_ref::<T>().cloned(),
            Entry::Vacant(entry) => {
                let value = init();
                let _ = entry.insert(Box::new(value.clone()));
                Some(value)
            }
        }
    }

    /// Mutate the value under `key` in place.
    ///
    /// Returns `None` if the key is missing or holds another type.
    pub fn update<T, R, F>(&self, key: &str, f: F) -> Option<R>
    where
        T: Send + Sync + 'static,
        F: FnOnce(&mut T) -> R,
    {
        let mut slot = self.inner.get_mut(key)?;
        slot.downcast_mut::<T>().map(f)
    }

    /// Remove the value under `key`. Returns `true` if something was removed.
    pub fn remove(&self, key: &str) -> bool {
        self.inner.remove(key).is_some()
    }

    /// Whether any value is stored under `key`.
    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Snapshot of the stored keys (sorted).
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }
}

impl std::fmt::Debug for Values {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Values").field("keys", &self.keys()).finish()
    }
}
