//! Application Store: the in-process cache of applications assigned to this
//! piped, kept current by the Command Stream and consulted by every other
//! component. Readers never block writers and always see a consistent
//! snapshot; writers publish a diff on every change so the Deployment
//! Trigger and Progress Reporter can react without polling.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;

use crate::types::{Application, ApplicationId, RepositoryId};

/// One published change to the store's contents.
#[derive(Clone, Debug, PartialEq)]
pub enum StoreEvent {
    Added(Application),
    Updated(Application),
    Removed(ApplicationId),
}

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Thread-safe, in-memory registry of [`Application`]s. Cloning an
/// `ApplicationStore` is cheap; clones share the same underlying map and
/// change stream.
#[derive(Clone)]
pub struct ApplicationStore {
    inner: Arc<RwLock<HashMap<ApplicationId, Application>>>,
    changes: Arc<broadcast::Sender<StoreEvent>>,
}

impl ApplicationStore {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            changes: Arc::new(tx),
        }
    }

    /// A consistent point-in-time snapshot of every non-deleted application.
    pub fn list(&self) -> Vec<Application> {
        self.inner
            .read()
            .expect("application store poisoned")
            .values()
            .filter(|app| !app.deleted)
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &ApplicationId) -> Option<Application> {
        self.inner.read().expect("application store poisoned").get(id).cloned()
    }

    /// Insert or replace an application, publishing `Added` the first time
    /// this id is seen and `Updated` thereafter.
    pub fn upsert(&self, app: Application) {
        let event = {
            let mut map = self.inner.write().expect("application store poisoned");
            let event = if map.contains_key(&app.id) {
                StoreEvent::Updated(app.clone())
            } else {
                StoreEvent::Added(app.clone())
            };
            map.insert(app.id.clone(), app);
            event
        };
        let _ = self.changes.send(event);
    }

    /// Mark an application deleted and publish `Removed`. The record is kept
    /// (not dropped from the map) so in-flight deployments can still resolve
    /// it by id; `list()` filters it out.
    pub fn remove(&self, id: &ApplicationId) {
        let removed = {
            let mut map = self.inner.write().expect("application store poisoned");
            if let Some(app) = map.get_mut(id) {
                app.deleted = true;
                true
            } else {
                false
            }
        };
        if removed {
            let _ = self.changes.send(StoreEvent::Removed(id.clone()));
        }
    }

    /// Replace the whole known set, diffing against the previous contents so
    /// subscribers see only what actually changed.
    pub fn reconcile(&self, applications: Vec<Application>) {
        let incoming: HashMap<ApplicationId, Application> =
            applications.into_iter().map(|a| (a.id.clone(), a)).collect();

        let removed_ids: Vec<ApplicationId> = {
            let map = self.inner.read().expect("application store poisoned");
            map.keys().filter(|id| !incoming.contains_key(*id)).cloned().collect()
        };
        for id in removed_ids {
            self.remove(&id);
        }
        for app in incoming.into_values() {
            self.upsert(app);
        }
    }

    /// Like [`reconcile`](Self::reconcile), but scoped to a single
    /// repository: only applications already in the store with this
    /// `repo_id` are candidates for removal, so ticking one repo's trigger
    /// never soft-deletes applications that belong to any other configured
    /// repository.
    pub fn reconcile_repo(&self, repo_id: &RepositoryId, applications: Vec<Application>) {
        let incoming: HashMap<ApplicationId, Application> =
            applications.into_iter().map(|a| (a.id.clone(), a)).collect();

        let removed_ids: Vec<ApplicationId> = {
            let map = self.inner.read().expect("application store poisoned");
            map.values()
                .filter(|app| &app.repo_id == repo_id && !incoming.contains_key(&app.id))
                .map(|app| app.id.clone())
                .collect()
        };
        for id in removed_ids {
            self.remove(&id);
        }
        for app in incoming.into_values() {
            self.upsert(app);
        }
    }

    /// Subscribe to the change stream. Each subscriber gets its own lagging
    /// receiver; a slow subscriber drops old events rather than stalling
    /// writers.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.changes.subscribe()
    }
}

impl Default for ApplicationStore {
    fn default() -> Self {
        Self::new()
    }
}
