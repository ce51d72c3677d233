//! List/watch cache of a [`RestStore`] dispatching change notifications.
use std::{
    collections::HashSet,
    hash::Hash,
    sync::Arc,
    time::Duration,
};

use futures::StreamExt;
use kube::Resource;
use kube_runtime::{
    reflector::{ObjectRef, Store, store::Writer},
    watcher,
};
use rustrial_k8s_apiextensions_apis::CustomResourceDefinition;
use serde::{Serialize, de::DeserializeOwned};
use tokio_util::sync::CancellationToken;

use crate::{
    errors::RegistryError,
    registry::RestStore,
    storage::WatchEvent,
};

const RELIST_DELAY: Duration = Duration::from_secs(1);

/// Callbacks invoked by an [`Informer`] after its cache has been updated.
pub(crate) trait ResourceEventHandler<K>: Send + Sync {
    fn on_add(&self, obj: &K);

    fn on_update(&self, old: &K, new: &K);

    fn on_delete(&self, obj: &K);
}

pub(crate) struct Informer<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    store: RestStore<K>,
    writer: Writer<K>,
    reader: Store<K>,
    handlers: Vec<Arc<dyn ResourceEventHandler<K>>>,
}

impl<K> Informer<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    pub fn new(store: RestStore<K>) -> Self {
        let writer = Writer::default();
        let reader = writer.as_reader();
        Self {
            store,
            writer,
            reader,
            handlers: Vec::new(),
        }
    }

    pub fn add_event_handler(&mut self, handler: Arc<dyn ResourceEventHandler<K>>) {
        self.handlers.push(handler);
    }

    pub fn reader(&self) -> Store<K> {
        self.reader.clone()
    }

    /// Lists and watches until cancelled, relisting whenever the watch expires.
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            let relisted = tokio::select! {
                _ = cancel.cancelled() => return,
                r = self.relist() => r,
            };
            let rv = match relisted {
                Ok(rv) => rv,
                Err(e) => {
                    warn!("Failed to list {}: {}", std::any::type_name::<K>(), e);
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(RELIST_DELAY) => continue,
                    }
                }
            };
            let mut stream = match self.store.watch(None, rv).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Failed to watch {}: {}", std::any::type_name::<K>(), e);
                    continue;
                }
            };
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => return,
                    e = stream.next() => e,
                };
                match event {
                    Some(Ok(event)) => {
                        if let Err(e) = self.apply(event) {
                            warn!("Failed to decode {}: {}", std::any::type_name::<K>(), e);
                        }
                    }
                    Some(Err(e)) => {
                        debug!("Watch of {} ended: {}", std::any::type_name::<K>(), e);
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    /// Replaces the cache content with a fresh list and dispatches the
    /// difference to the handlers.
    async fn relist(&mut self) -> Result<u64, RegistryError> {
        let (items, rv) = self.store.list_raw(None).await?;
        let objects = items
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<K>, _>>()?;
        let previous = self.reader.state();
        self.writer.apply_watcher_event(&watcher::Event::Init);
        for obj in &objects {
            self.writer
                .apply_watcher_event(&watcher::Event::InitApply(obj.clone()));
        }
        self.writer.apply_watcher_event(&watcher::Event::InitDone);

        let mut seen = HashSet::with_capacity(objects.len());
        for obj in &objects {
            let key = ObjectRef::from_obj(obj);
            let old = previous
                .iter()
                .find(|p| ObjectRef::from_obj(p.as_ref()) == key);
            match old {
                Some(old) if old.meta().resource_version == obj.meta().resource_version => (),
                Some(old) => self.handlers.iter().for_each(|h| h.on_update(old, obj)),
                None => self.handlers.iter().for_each(|h| h.on_add(obj)),
            }
            seen.insert(key);
        }
        for old in previous {
            if !seen.contains(&ObjectRef::from_obj(old.as_ref())) {
                self.handlers.iter().for_each(|h| h.on_delete(&old));
            }
        }
        Ok(rv)
    }

    fn apply(&mut self, event: WatchEvent) -> Result<(), serde_json::Error> {
        match event {
            WatchEvent::Added(v) | WatchEvent::Modified(v) => {
                let obj: K = serde_json::from_value(v)?;
                let old = self.reader.get(&ObjectRef::from_obj(&obj));
                self.writer
                    .apply_watcher_event(&watcher::Event::Apply(obj.clone()));
                match old {
                    Some(old) => self.handlers.iter().for_each(|h| h.on_update(&old, &obj)),
                    None => self.handlers.iter().for_each(|h| h.on_add(&obj)),
                }
            }
            WatchEvent::Deleted(v) => {
                let obj: K = serde_json::from_value(v)?;
                self.writer
                    .apply_watcher_event(&watcher::Event::Delete(obj.clone()));
                self.handlers.iter().for_each(|h| h.on_delete(&obj));
            }
        }
        Ok(())
    }
}

/// Read access to the cached definitions.
#[derive(Clone)]
pub(crate) struct CrdLister {
    store: Store<CustomResourceDefinition>,
}

impl CrdLister {
    pub fn new(store: Store<CustomResourceDefinition>) -> Self {
        Self { store }
    }

    pub fn get(&self, name: &str) -> Option<Arc<CustomResourceDefinition>> {
        self.store.get(&ObjectRef::new(name))
    }

    pub fn list(&self) -> Vec<Arc<CustomResourceDefinition>> {
        self.store.state()
    }

    /// Waits until the initial list has been loaded, `false` if the informer is gone.
    pub async fn wait_for_sync(&self) -> bool {
        self.store.wait_until_ready().await.is_ok()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        crd_registry::{CrdRegistry, tests::crd},
        storage::MemoryStorage,
    };
    use std::sync::Mutex;

    /// A lister over the given definitions, the writer must be kept alive.
    pub(crate) fn lister(
        crds: Vec<CustomResourceDefinition>,
    ) -> (CrdLister, Writer<CustomResourceDefinition>) {
        let mut writer = Writer::default();
        writer.apply_watcher_event(&watcher::Event::Init);
        for c in crds {
            writer.apply_watcher_event(&watcher::Event::InitApply(c));
        }
        writer.apply_watcher_event(&watcher::Event::InitDone);
        (CrdLister::new(writer.as_reader()), writer)
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl ResourceEventHandler<CustomResourceDefinition> for Recorder {
        fn on_add(&self, obj: &CustomResourceDefinition) {
            self.0.lock().unwrap().push(format!("add {}", obj.metadata.name.as_deref().unwrap_or_default()));
        }

        fn on_update(&self, _old: &CustomResourceDefinition, new: &CustomResourceDefinition) {
            self.0.lock().unwrap().push(format!("update {}", new.metadata.name.as_deref().unwrap_or_default()));
        }

        fn on_delete(&self, obj: &CustomResourceDefinition) {
            self.0.lock().unwrap().push(format!("delete {}", obj.metadata.name.as_deref().unwrap_or_default()));
        }
    }

    async fn eventually(recorder: &Recorder, expected: &[&str]) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if recorder.0.lock().unwrap().len() >= expected.len() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(expected, recorder.0.lock().unwrap().as_slice());
    }

    #[tokio::test]
    async fn informer_dispatches_changes() {
        let registry = CrdRegistry::new(Arc::new(MemoryStorage::new()));
        registry
            .store()
            .create(None, crd("example.com", "widgets", "Widget"), false)
            .await
            .unwrap();

        let recorder = Arc::new(Recorder::default());
        let mut informer = Informer::new(registry.store().clone());
        informer.add_event_handler(recorder.clone());
        let lister = CrdLister::new(informer.reader());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(informer.run(cancel.clone()));

        assert!(lister.wait_for_sync().await);
        eventually(&recorder, &["add widgets.example.com"]).await;
        assert!(lister.get("widgets.example.com").is_some());

        registry
            .store()
            .create(None, crd("example.com", "gadgets", "Gadget"), false)
            .await
            .unwrap();
        registry
            .store()
            .delete(None, "widgets.example.com", &Default::default())
            .await
            .unwrap();
        eventually(
            &recorder,
            &[
                "add widgets.example.com",
                "add gadgets.example.com",
                "update widgets.example.com",
            ],
        )
        .await;
        let deleting = lister.get("widgets.example.com").unwrap();
        assert!(deleting.is_deleted());
        assert_eq!(2, lister.list().len());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn lister_reads_cached_definitions() {
        let (lister, _writer) = lister(vec![crd("example.com", "widgets", "Widget")]);
        assert!(lister.wait_for_sync().await);
        assert!(lister.get("widgets.example.com").is_some());
        assert!(lister.get("gadgets.example.com").is_none());
        assert_eq!(1, lister.list().len());
    }
}
