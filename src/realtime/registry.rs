//! Handler registry for inbound frames and connection lifecycle events.
//!
//! Dispatch works on a snapshot of the handler list taken under the lock and
//! invoked after releasing it, so handlers may register or remove handlers
//! (including themselves) without deadlocking or disturbing the dispatch in
//! progress.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::realtime::proto::InboundFrame;

pub type MessageHandler = Arc<dyn Fn(&InboundFrame) + Send + Sync>;
pub type LifecycleHandler = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
enum HandlerKey {
    Message(String),
    Connect,
    Disconnect,
}

#[derive(Clone)]
enum Handler {
    Message(MessageHandler),
    Lifecycle(LifecycleHandler),
}

#[derive(Default)]
struct RegistryState {
    next_id: u64,
    handlers: HashMap<HandlerKey, Vec<(u64, Handler)>>,
}

impl RegistryState {
    fn insert(&mut self, key: HandlerKey, handler: Handler) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.handlers.entry(key).or_default().push((id, handler));
        id
    }

    fn remove(&mut self, key: &HandlerKey, id: u64) -> bool {
        let Some(entries) = self.handlers.get_mut(key) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            self.handlers.remove(key);
        }
        removed
    }

    fn snapshot(&self, key: &HandlerKey) -> Vec<Handler> {
        self.handlers
            .get(key)
            .map(|entries| entries.iter().map(|(_, handler)| handler.clone()).collect())
            .unwrap_or_default()
    }
}

#[derive(Clone, Default)]
pub(crate) struct HandlerRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl HandlerRegistry {
    pub(crate) fn on_message(&self, kind: String, handler: MessageHandler) -> Registration {
        self.register(HandlerKey::Message(kind), Handler::Message(handler))
    }

    pub(crate) fn on_connect(&self, handler: LifecycleHandler) -> Registration {
        self.register(HandlerKey::Connect, Handler::Lifecycle(handler))
    }

    pub(crate) fn on_disconnect(&self, handler: LifecycleHandler) -> Registration {
        self.register(HandlerKey::Disconnect, Handler::Lifecycle(handler))
    }

    /// Invokes every handler registered for the frame's kind, in
    /// registration order. Returns how many handlers ran.
    pub(crate) fn dispatch(&self, frame: &InboundFrame) -> usize {
        let handlers = self.lock().snapshot(&HandlerKey::Message(frame.kind.clone()));
        for handler in &handlers {
            if let Handler::Message(handler) = handler {
                handler(frame);
            }
        }
        handlers.len()
    }

    pub(crate) fn emit_connect(&self) {
        self.emit(&HandlerKey::Connect);
    }

    pub(crate) fn emit_disconnect(&self) {
        self.emit(&HandlerKey::Disconnect);
    }

    fn emit(&self, key: &HandlerKey) {
        let handlers = self.lock().snapshot(key);
        for handler in &handlers {
            if let Handler::Lifecycle(handler) = handler {
                handler();
            }
        }
    }

    fn register(&self, key: HandlerKey, handler: Handler) -> Registration {
        let id = self.lock().insert(key.clone(), handler);
        Registration {
            state: Arc::downgrade(&self.state),
            key,
            id,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Capability to remove one handler registration.
///
/// Dropping it leaves the handler registered.
#[derive(Debug)]
pub struct Registration {
    state: Weak<Mutex<RegistryState>>,
    key: HandlerKey,
    id: u64,
}

impl Registration {
    /// Removes exactly the handler this registration was returned for.
    ///
    /// Returns `false` if it was already gone (the channel was dropped).
    pub fn remove(self) -> bool {
        let Some(state) = self.state.upgrade() else {
            return false;
        };
        let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
        guard.remove(&self.key, self.id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::HandlerRegistry;
    use crate::realtime::proto::InboundFrame;

    fn frame(text: &str) -> InboundFrame {
        InboundFrame::parse(text).expect("frame")
    }

    fn recorder() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[test]
    fn dispatches_in_registration_order_once_each() {
        let registry = HandlerRegistry::default();
        let calls = recorder();

        for name in ["h1", "h2"] {
            let calls = Arc::clone(&calls);
            let _ = registry.on_message(
                "foo".to_string(),
                Arc::new(move |frame: &InboundFrame| {
                    assert_eq!(frame.payload(), Some(&json!(1)));
                    calls.lock().expect("calls").push(name.to_string());
                }),
            );
        }

        let ran = registry.dispatch(&frame(r#"{"type":"foo","payload":1}"#));

        assert_eq!(ran, 2);
        assert_eq!(*calls.lock().expect("calls"), vec!["h1", "h2"]);
    }

    #[test]
    fn duplicate_handlers_run_once_per_registration() {
        let registry = HandlerRegistry::default();
        let calls = recorder();
        let handler: super::MessageHandler = {
            let calls = Arc::clone(&calls);
            Arc::new(move |_: &InboundFrame| calls.lock().expect("calls").push("h".to_string()))
        };

        let _first = registry.on_message("foo".to_string(), Arc::clone(&handler));
        let second = registry.on_message("foo".to_string(), handler);
        registry.dispatch(&frame(r#"{"type":"foo"}"#));
        assert_eq!(calls.lock().expect("calls").len(), 2);

        assert!(second.remove());
        registry.dispatch(&frame(r#"{"type":"foo"}"#));
        assert_eq!(calls.lock().expect("calls").len(), 3);
    }

    #[test]
    fn removal_only_affects_its_own_registration() {
        let registry = HandlerRegistry::default();
        let calls = recorder();

        let first = {
            let calls = Arc::clone(&calls);
            registry.on_message(
                "foo".to_string(),
                Arc::new(move |_: &InboundFrame| calls.lock().expect("calls").push("h1".into())),
            )
        };
        let _second = {
            let calls = Arc::clone(&calls);
            registry.on_message(
                "foo".to_string(),
                Arc::new(move |_: &InboundFrame| calls.lock().expect("calls").push("h2".into())),
            )
        };

        assert!(first.remove());
        registry.dispatch(&frame(r#"{"type":"foo"}"#));

        assert_eq!(*calls.lock().expect("calls"), vec!["h2"]);
    }

    #[test]
    fn unknown_kind_runs_nothing() {
        let registry = HandlerRegistry::default();
        let _ = registry.on_message("foo".to_string(), Arc::new(|_: &InboundFrame| panic!()));

        assert_eq!(registry.dispatch(&frame(r#"{"type":"bar"}"#)), 0);
    }

    #[test]
    fn untagged_frames_reach_default_kind_handlers() {
        let registry = HandlerRegistry::default();
        let calls = recorder();
        let _ = {
            let calls = Arc::clone(&calls);
            registry.on_message(
                "message".to_string(),
                Arc::new(move |frame: &InboundFrame| {
                    calls.lock().expect("calls").push(frame.body.to_string())
                }),
            )
        };

        registry.dispatch(&frame(r#"{"payload":2}"#));

        assert_eq!(*calls.lock().expect("calls"), vec![r#"{"payload":2}"#]);
    }

    #[test]
    fn handlers_can_mutate_registry_during_dispatch() {
        let registry = HandlerRegistry::default();
        let calls = recorder();

        let late_calls = Arc::clone(&calls);
        let registry_for_handler = registry.clone();
        let _ = registry.on_message(
            "foo".to_string(),
            Arc::new(move |_: &InboundFrame| {
                let late_calls = Arc::clone(&late_calls);
                let _ = registry_for_handler.on_message(
                    "foo".to_string(),
                    Arc::new(move |_: &InboundFrame| {
                        late_calls.lock().expect("calls").push("late".into())
                    }),
                );
            }),
        );

        assert_eq!(registry.dispatch(&frame(r#"{"type":"foo"}"#)), 1);
        assert!(calls.lock().expect("calls").is_empty());

        assert_eq!(registry.dispatch(&frame(r#"{"type":"foo"}"#)), 2);
        assert_eq!(*calls.lock().expect("calls"), vec!["late"]);
    }

    #[test]
    fn lifecycle_handlers_are_separate_from_messages() {
        let registry = HandlerRegistry::default();
        let calls = recorder();

        let connect = {
            let calls = Arc::clone(&calls);
            registry.on_connect(Arc::new(move || calls.lock().expect("calls").push("up".into())))
        };
        let _disconnect = {
            let calls = Arc::clone(&calls);
            registry
                .on_disconnect(Arc::new(move || calls.lock().expect("calls").push("down".into())))
        };

        registry.emit_connect();
        registry.emit_disconnect();
        assert!(connect.remove());
        registry.emit_connect();

        assert_eq!(*calls.lock().expect("calls"), vec!["up", "down"]);
    }

    #[test]
    fn registration_outliving_registry_is_inert() {
        let registry = HandlerRegistry::default();
        let registration = registry.on_connect(Arc::new(|| {}));
        drop(registry);

        assert!(!registration.remove());
    }
}
