use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::ProtocolError;

pub type NotificationHandler = Arc<dyn Fn(Option<Value>) + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(&ProtocolError) + Send + Sync>;
pub type TrafficHandler = Arc<dyn Fn(Direction, &str) + Send + Sync>;

/// Handle returned by every subscription; pass it to `off` to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Which way a logged message travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Send => "send",
            Direction::Receive => "receive",
        }
    }

    /// Arrow used in the console trace (`Client > ...`).
    pub fn arrow(self) -> &'static str {
        match self {
            Direction::Send => ">",
            Direction::Receive => "<",
        }
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-engine event routing: notification events keyed by method name, plus
/// the error and traffic channels.
///
/// Handlers for one event run synchronously in registration order. The
/// handler list is snapshotted before invocation so a handler may subscribe
/// or unsubscribe without deadlocking.
pub struct EventDispatcher {
    notifications: DashMap<String, Vec<(SubscriptionId, NotificationHandler)>>,
    errors: Mutex<Vec<(SubscriptionId, ErrorHandler)>>,
    traffic: Mutex<Vec<(SubscriptionId, TrafficHandler)>>,
    next_id: AtomicU64,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            notifications: DashMap::new(),
            errors: Mutex::new(Vec::new()),
            traffic: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn subscribe(&self, event: &str, handler: NotificationHandler) -> SubscriptionId {
        let id = self.next_id();
        self.notifications
            .entry(event.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    pub fn subscribe_errors(&self, handler: ErrorHandler) -> SubscriptionId {
        let id = self.next_id();
        lock(&self.errors).push((id, handler));
        id
    }

    pub fn subscribe_traffic(&self, handler: TrafficHandler) -> SubscriptionId {
        let id = self.next_id();
        lock(&self.traffic).push((id, handler));
        id
    }

    /// Remove a subscription of any kind. Returns true if it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut removed = false;
        for mut entry in self.notifications.iter_mut() {
            let before = entry.len();
            entry.retain(|(sid, _)| *sid != id);
            removed |= entry.len() != before;
        }
        self.notifications.retain(|_, handlers| !handlers.is_empty());

        let mut errors = lock(&self.errors);
        let before = errors.len();
        errors.retain(|(sid, _)| *sid != id);
        removed |= errors.len() != before;
        drop(errors);

        let mut traffic = lock(&self.traffic);
        let before = traffic.len();
        traffic.retain(|(sid, _)| *sid != id);
        removed |= traffic.len() != before;

        removed
    }

    /// Number of handlers subscribed to `event`.
    pub fn listener_count(&self, event: &str) -> usize {
        self.notifications.get(event).map(|h| h.len()).unwrap_or(0)
    }

    /// Invoke every handler of `event`. Returns how many ran.
    pub fn emit(&self, event: &str, params: Option<Value>) -> usize {
        let handlers: Vec<NotificationHandler> = match self.notifications.get(event) {
            Some(entry) => entry.iter().map(|(_, h)| h.clone()).collect(),
            None => Vec::new(),
        };
        if handlers.is_empty() {
            tracing::debug!(event, "Notification has no subscribers");
        }
        for handler in &handlers {
            handler(params.clone());
        }
        handlers.len()
    }

    pub fn emit_error(&self, error: &ProtocolError) {
        let handlers: Vec<ErrorHandler> = lock(&self.errors)
            .iter()
            .map(|(_, h)| h.clone())
            .collect();
        if handlers.is_empty() {
            tracing::warn!(%error, "Unhandled protocol error");
        }
        for handler in &handlers {
            handler(error);
        }
    }

    pub fn emit_traffic(&self, direction: Direction, message: &str) {
        let handlers: Vec<TrafficHandler> = lock(&self.traffic)
            .iter()
            .map(|(_, h)| h.clone())
            .collect();
        for handler in &handlers {
            handler(direction, message);
        }
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn handlers_run_in_registration_order() {
        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let seen = seen.clone();
            dispatcher.subscribe(
                "Game.levelUp",
                Arc::new(move |params: Option<Value>| {
                    seen.lock().unwrap().push((tag, params))
                }),
            );
        }

        let ran = dispatcher.emit("Game.levelUp", Some(json!({"level": 2})));
        assert_eq!(ran, 2);
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], ("first", Some(json!({"level": 2}))));
        assert_eq!(seen[1].0, "second");
    }

    #[test]
    fn emit_without_subscribers_is_a_no_op() {
        let dispatcher = EventDispatcher::new();
        assert_eq!(dispatcher.emit("nobody", None), 0);
    }

    #[test]
    fn unsubscribe_removes_only_that_handler() {
        let dispatcher = EventDispatcher::new();
        let a = dispatcher.subscribe("tick", Arc::new(|_: Option<Value>| {}));
        let _b = dispatcher.subscribe("tick", Arc::new(|_: Option<Value>| {}));
        assert_eq!(dispatcher.listener_count("tick"), 2);

        assert!(dispatcher.unsubscribe(a));
        assert_eq!(dispatcher.listener_count("tick"), 1);
        assert!(!dispatcher.unsubscribe(a));
    }

    #[test]
    fn handler_may_subscribe_while_being_invoked() {
        let dispatcher = Arc::new(EventDispatcher::new());
        let inner = dispatcher.clone();
        dispatcher.subscribe(
            "once",
            Arc::new(move |_: Option<Value>| {
                inner.subscribe("later", Arc::new(|_: Option<Value>| {}));
            }),
        );
        dispatcher.emit("once", None);
        assert_eq!(dispatcher.listener_count("later"), 1);
    }

    #[test]
    fn errors_and_traffic_reach_their_own_subscribers() {
        let dispatcher = EventDispatcher::new();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let traffic = Arc::new(Mutex::new(Vec::new()));

        let errors_clone = errors.clone();
        dispatcher.subscribe_errors(Arc::new(move |e: &ProtocolError| {
            errors_clone.lock().unwrap().push(e.to_string())
        }));
        let traffic_clone = traffic.clone();
        let traffic_id = dispatcher.subscribe_traffic(Arc::new(move |dir: Direction, msg: &str| {
            traffic_clone.lock().unwrap().push(format!("{} {}", dir.as_str(), msg))
        }));

        dispatcher.emit_error(&ProtocolError::Empty);
        dispatcher.emit_traffic(Direction::Send, "{}");
        assert!(dispatcher.unsubscribe(traffic_id));
        dispatcher.emit_traffic(Direction::Receive, "ignored");

        assert_eq!(
            *errors.lock().unwrap(),
            vec!["Message cannot be null, empty or undefined".to_string()]
        );
        assert_eq!(*traffic.lock().unwrap(), vec!["send {}".to_string()]);
    }
}
