use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::de::DeserializeOwned;

use crate::descriptor::TaskId;
use crate::error::{StoreError, ValueError};
use crate::value::Value;

type Shared = Arc<DashMap<TaskId, Value>>;

/// Thread-safe mapping from a task to the value it produced.
///
/// Every key has a single writer, the task that owns the id. Tasks that
/// produced no value never appear in the store.
#[derive(Default)]
pub(crate) struct ResultStore {
    map: Shared,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, id: TaskId, value: Value) -> Result<(), StoreError> {
        match self.map.entry(id) {
            Entry::Occupied(entry) => Err(StoreError::AlreadyWritten(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(value);
                Ok(())
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Value> {
        self.map.get(id).map(|entry| entry.value().clone())
    }

    /// Read-only view handed to a task body. The view shares the underlying
    /// map, so it reflects every earlier write and possibly later ones.
    pub fn snapshot(&self) -> Results {
        Results {
            map: self.map.clone(),
        }
    }
}

/// Read-only view over task results, passed to every task body.
#[derive(Clone, Default)]
pub struct Results {
    map: Shared,
}

impl Results {
    /// Returns the raw value produced by task `id`.
    pub fn get(&self, id: impl AsRef<str>) -> Option<Value> {
        self.map.get(id.as_ref()).map(|entry| entry.value().clone())
    }

    /// Returns the value produced by task `id`, decoded into `T`.
    ///
    /// `Ok(None)` means the task produced nothing, or failed and was not
    /// substituted by an exception handler.
    pub fn get_as<T>(&self, id: impl AsRef<str>) -> Result<Option<T>, ValueError>
    where
        T: DeserializeOwned,
    {
        self.get(id).map(|value| value.decode()).transpose()
    }

    pub fn contains(&self, id: impl AsRef<str>) -> bool {
        self.map.contains_key(id.as_ref())
    }

    pub fn keys(&self) -> Vec<TaskId> {
        let mut keys: Vec<_> = self.map.iter().map(|entry| entry.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Flattens the view into key-sorted pairs for the remote envelope.
    pub fn to_bundle(&self) -> Vec<(TaskId, Value)> {
        let mut bundle: Vec<_> = self
            .map
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        bundle.sort_by(|a, b| a.0.cmp(&b.0));
        bundle
    }

    /// Materializes a view from pairs received over the remote envelope.
    pub fn from_bundle(bundle: impl IntoIterator<Item = (TaskId, Value)>) -> Self {
        Self {
            map: Arc::new(bundle.into_iter().collect()),
        }
    }
}

impl std::fmt::Debug for Results {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_once() {
        let store = ResultStore::new();
        let id = TaskId::from("app::Config");

        store.put(id.clone(), Value::encode(&1u8).unwrap()).unwrap();
        let err = store.put(id.clone(), Value::encode(&2u8).unwrap());

        assert!(matches!(err, Err(StoreError::AlreadyWritten(ref key)) if *key == id));
        assert_eq!(store.get("app::Config").unwrap().decode::<u8>().unwrap(), 1);
    }

    #[test]
    fn test_snapshot_sees_earlier_writes() {
        let store = ResultStore::new();
        store.put("a".into(), Value::encode("1").unwrap()).unwrap();

        let view = store.snapshot();
        assert_eq!(view.get_as::<String>("a").unwrap().as_deref(), Some("1"));
        assert_eq!(view.get_as::<String>("missing").unwrap(), None);
        assert!(!view.contains("b"));
    }

    #[test]
    fn test_concurrent_writers() {
        let store = Arc::new(ResultStore::new());

        std::thread::scope(|s| {
            for i in 0..16u32 {
                let store = store.clone();
                s.spawn(move || {
                    store
                        .put(format!("task{i}").into(), Value::encode(&i).unwrap())
                        .unwrap();
                });
            }
        });

        let view = store.snapshot();
        assert_eq!(view.len(), 16);
        for i in 0..16u32 {
            assert_eq!(view.get_as::<u32>(format!("task{i}")).unwrap(), Some(i));
        }
    }

    #[test]
    fn test_bundle_is_sorted() {
        let view = Results::from_bundle([
            (TaskId::from("b"), Value::encode(&2).unwrap()),
            (TaskId::from("a"), Value::encode(&1).unwrap()),
        ]);

        let keys: Vec<_> = view.to_bundle().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![TaskId::from("a"), TaskId::from("b")]);
    }
}
