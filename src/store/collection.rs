use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, RwLock};

use crate::error::{DispatchError, Result};
use crate::model::{
    Calculation, CalculationBulk, CalculationBulkFactory, ObjectMeta, Phase, WorkerPool,
    WorkerProcess,
};

use super::selector::Selector;

/// Capacity of each collection's event fan-out. Watchers that fall this far
/// behind miss events and must re-list.
const WATCH_BUFFER: usize = 256;

/// A storable entity: named, namespaced, versioned.
pub trait Object: Clone + Send + Sync + 'static {
    const KIND: &'static str;

    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;
}

macro_rules! impl_object {
    ($ty:ty, $kind:literal) => {
        impl Object for $ty {
            const KIND: &'static str = $kind;

            fn meta(&self) -> &ObjectMeta {
                &self.meta
            }

            fn meta_mut(&mut self) -> &mut ObjectMeta {
                &mut self.meta
            }
        }
    };
}

impl_object!(Calculation, "Calculation");
impl_object!(CalculationBulk, "CalculationBulk");
impl_object!(CalculationBulkFactory, "CalculationBulkFactory");
impl_object!(WorkerPool, "WorkerPool");
impl_object!(WorkerProcess, "WorkerProcess");

/// Change notification delivered to watchers of a collection.
#[derive(Debug, Clone)]
pub enum Event<T> {
    Created(T),
    Updated(T),
    Deleted(T),
}

impl<T: Object> Event<T> {
    pub fn object(&self) -> &T {
        match self {
            Event::Created(obj) | Event::Updated(obj) | Event::Deleted(obj) => obj,
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        self.object().meta()
    }
}

/// One kind's worth of objects, keyed by `namespace/name`.
pub struct Collection<T> {
    inner: Arc<RwLock<BTreeMap<String, T>>>,
    events: broadcast::Sender<Event<T>>,
}

impl<T> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            events: self.events.clone(),
        }
    }
}

impl<T: Object> Default for Collection<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn object_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

impl<T: Object> Collection<T> {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            inner: Arc::new(RwLock::new(BTreeMap::new())),
            events,
        }
    }

    /// Subscribe to change events. Only events sent after the call are seen.
    pub fn watch(&self) -> broadcast::Receiver<Event<T>> {
        self.events.subscribe()
    }

    pub async fn get(&self, namespace: &str, name: &str) -> Result<T> {
        let objects = self.inner.read().await;
        objects
            .get(&object_key(namespace, name))
            .cloned()
            .ok_or_else(|| DispatchError::not_found(T::KIND, name))
    }

    pub async fn list(&self, namespace: &str, selector: &Selector) -> Result<Vec<T>> {
        let objects = self.inner.read().await;
        Ok(objects
            .values()
            .filter(|obj| obj.meta().namespace == namespace && selector.matches(obj.meta()))
            .cloned()
            .collect())
    }

    /// Insert a new object, stamping its initial version and creation time.
    pub async fn create(&self, mut obj: T) -> Result<T> {
        let key = object_key(&obj.meta().namespace, &obj.meta().name);
        let mut objects = self.inner.write().await;
        if objects.contains_key(&key) {
            return Err(DispatchError::already_exists(T::KIND, &obj.meta().name));
        }
        let meta = obj.meta_mut();
        meta.resource_version = 1;
        if meta.creation_time.is_none() {
            meta.creation_time = Some(Utc::now());
        }
        objects.insert(key, obj.clone());
        drop(objects);
        let _ = self.events.send(Event::Created(obj.clone()));
        Ok(obj)
    }

    /// Replace an existing object. The caller must send back the version it
    /// read; a mismatch means someone wrote in between and yields a
    /// conflict.
    pub async fn update(&self, mut obj: T) -> Result<T> {
        let key = object_key(&obj.meta().namespace, &obj.meta().name);
        let mut objects = self.inner.write().await;
        let current = objects
            .get(&key)
            .ok_or_else(|| DispatchError::not_found(T::KIND, &obj.meta().name))?;
        if current.meta().resource_version != obj.meta().resource_version {
            return Err(DispatchError::conflict(T::KIND, &obj.meta().name));
        }
        obj.meta_mut().resource_version += 1;
        objects.insert(key, obj.clone());
        drop(objects);
        let _ = self.events.send(Event::Updated(obj.clone()));
        Ok(obj)
    }

    pub async fn delete(&self, namespace: &str, name: &str) -> Result<T> {
        let mut objects = self.inner.write().await;
        let obj = objects
            .remove(&object_key(namespace, name))
            .ok_or_else(|| DispatchError::not_found(T::KIND, name))?;
        drop(objects);
        let _ = self.events.send(Event::Deleted(obj.clone()));
        Ok(obj)
    }
}

impl Collection<Calculation> {
    /// Calculations in the namespace currently in `phase`.
    pub async fn list_in_phase(&self, namespace: &str, phase: Phase) -> Result<Vec<Calculation>> {
        let all = self.list(namespace, &Selector::everything()).await?;
        Ok(all
            .into_iter()
            .filter(|c| c.phase == Some(phase))
            .collect())
    }
}

/// All collections the dispatcher and worker agents operate on.
#[derive(Clone, Default)]
pub struct MemoryStore {
    pub calculations: Collection<Calculation>,
    pub bulks: Collection<CalculationBulk>,
    pub factories: Collection<CalculationBulkFactory>,
    pub pools: Collection<WorkerPool>,
    pub processes: Collection<WorkerProcess>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}
