//! Synchronous in-process event bus.
//!
//! Listeners run inline on the emitting thread, in registration order.
//! There are no delivery guarantees across restarts; the bus is purely a
//! decoupling seam between the registry, the gateway and the supervisor.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::model::{Plugin, ServiceInfo, UserInfo, WorkspaceInfo};

/// Payload delivered to listeners.
#[derive(Debug, Clone)]
pub enum Event {
    /// A workspace was added to the registry.
    WorkspaceRegistered(Arc<WorkspaceInfo>),
    /// A workspace was removed from the registry.
    WorkspaceUnregistered(String),
    /// A plugin completed registration.
    PluginRegistered(Arc<Plugin>),
    /// A plugin was terminated or replaced.
    PluginTerminated(Arc<Plugin>),
    /// A service was registered.
    ServiceRegistered(Arc<ServiceInfo>),
    /// A service was removed together with its provider.
    ServiceUnregistered(Arc<ServiceInfo>),
    /// A user session was admitted.
    UserConnected(Arc<UserInfo>),
    /// A user's last session ended.
    UserDisconnected(String),
    /// A user obtained a bound workspace view.
    UserEnteredWorkspace {
        /// The entering user.
        user: Arc<UserInfo>,
        /// The workspace name.
        workspace: String,
    },
}

impl Event {
    /// Event name listeners subscribe under.
    pub fn name(&self) -> &'static str {
        match self {
            Event::WorkspaceRegistered(_) => "workspace_registered",
            Event::WorkspaceUnregistered(_) => "workspace_unregistered",
            Event::PluginRegistered(_) => "plugin_registered",
            Event::PluginTerminated(_) => "plugin_terminated",
            Event::ServiceRegistered(_) => "service_registered",
            Event::ServiceUnregistered(_) => "service_unregistered",
            Event::UserConnected(_) => "user_connected",
            Event::UserDisconnected(_) => "user_disconnected",
            Event::UserEnteredWorkspace { .. } => "user_entered_workspace",
        }
    }
}

/// Handle returned by [`EventBus::on`], usable with [`EventBus::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

struct Entry {
    id: ListenerId,
    listener: Listener,
    once: bool,
}

/// Synchronous pub/sub with `on` / `once` / `off` / `emit`.
#[derive(Default)]
pub struct EventBus {
    inner: Mutex<BusState>,
}

#[derive(Default)]
struct BusState {
    listeners: HashMap<String, Vec<Entry>>,
    next_id: u64,
}

impl EventBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener for `name`; returns its handle.
    pub fn on<F>(&self, name: &str, listener: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.register(name, Arc::new(listener), false)
    }

    /// Registers a listener removed after its first delivery.
    pub fn once<F>(&self, name: &str, listener: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.register(name, Arc::new(listener), true)
    }

    fn register(&self, name: &str, listener: Listener, once: bool) -> ListenerId {
        let mut state = self.inner.lock();
        state.next_id += 1;
        let id = ListenerId(state.next_id);
        state
            .listeners
            .entry(name.to_string())
            .or_default()
            .push(Entry { id, listener, once });
        id
    }

    /// Removes one listener, or every listener for `name` when `id` is
    /// `None`.
    pub fn off(&self, name: &str, id: Option<ListenerId>) {
        let mut state = self.inner.lock();
        match id {
            Some(id) => {
                if let Some(entries) = state.listeners.get_mut(name) {
                    entries.retain(|e| e.id != id);
                }
            }
            None => {
                state.listeners.remove(name);
            }
        }
    }

    /// Delivers an event to every listener registered under its name, in
    /// registration order. `once` listeners are removed before delivery so
    /// a listener re-emitting the same event cannot run twice.
    pub fn emit(&self, event: &Event) {
        let to_call: Vec<Listener> = {
            let mut state = self.inner.lock();
            let Some(entries) = state.listeners.get_mut(event.name()) else {
                return;
            };
            let listeners = entries.iter().map(|e| Arc::clone(&e.listener)).collect();
            entries.retain(|e| !e.once);
            listeners
        };
        for listener in to_call {
            listener(event);
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        let count: usize = state.listeners.values().map(Vec::len).sum();
        write!(f, "EventBus({count} listeners)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn workspace_event(name: &str) -> Event {
        Event::WorkspaceRegistered(Arc::new(WorkspaceInfo::new(name, vec!["root".into()])))
    }

    #[test]
    fn listeners_run_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            bus.on("workspace_registered", move |_| order.lock().push(tag));
        }
        bus.emit(&workspace_event("lab"));
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn once_listener_fires_a_single_time() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        bus.once("workspace_registered", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(&workspace_event("a"));
        bus.emit(&workspace_event("b"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn off_removes_a_specific_listener() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let id = bus.on("workspace_registered", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        bus.off("workspace_registered", Some(id));
        bus.emit(&workspace_event("lab"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
