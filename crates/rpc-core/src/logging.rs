use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::events::{Direction, EventDispatcher};

/// Message logging switches shared by [`crate::Client`] and [`crate::Server`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogOptions {
    /// Re-emit every sent and received message to `on_traffic` subscribers.
    pub log_to_events: bool,
    /// Write every sent and received message to stderr.
    pub log_to_console: bool,
}

pub type ClientOptions = LogOptions;
pub type ServerOptions = LogOptions;

/// Traffic logger owned by one engine. Switches can be flipped at runtime.
pub(crate) struct TrafficLog {
    role: &'static str,
    to_events: AtomicBool,
    to_console: AtomicBool,
}

impl TrafficLog {
    pub(crate) fn new(role: &'static str, options: LogOptions) -> Self {
        let log = Self {
            role,
            to_events: AtomicBool::new(false),
            to_console: AtomicBool::new(false),
        };
        log.set(options);
        log
    }

    pub(crate) fn set(&self, options: LogOptions) {
        self.to_events.store(options.log_to_events, Ordering::Relaxed);
        self.to_console
            .store(options.log_to_console, Ordering::Relaxed);
    }

    pub(crate) fn options(&self) -> LogOptions {
        LogOptions {
            log_to_events: self.to_events.load(Ordering::Relaxed),
            log_to_console: self.to_console.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record(&self, direction: Direction, message: &str, events: &EventDispatcher) {
        tracing::trace!(
            role = self.role,
            direction = direction.as_str(),
            frame = message,
            "JSON-RPC traffic"
        );

        if self.to_console.load(Ordering::Relaxed) {
            eprintln!("{}", console_line(self.role, direction, message));
        }

        if self.to_events.load(Ordering::Relaxed) {
            events.emit_traffic(direction, message);
        }
    }
}

/// One stderr trace line, e.g. `Client > {"id":1,"method":"help"}`.
pub(crate) fn console_line(role: &str, direction: Direction, message: &str) -> String {
    format!("{} {} {}", role, direction.arrow(), message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn options_default_to_off() {
        let opts = LogOptions::default();
        assert!(!opts.log_to_events);
        assert!(!opts.log_to_console);

        let parsed: LogOptions = serde_json::from_str(r#"{"log_to_events":true}"#).unwrap();
        assert!(parsed.log_to_events);
        assert!(!parsed.log_to_console);
    }

    #[test]
    fn traffic_reaches_events_only_when_enabled() {
        let events = EventDispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        events.subscribe_traffic(Arc::new(move |dir: Direction, msg: &str| {
            seen_clone.lock().unwrap().push((dir, msg.to_string()))
        }));

        let log = TrafficLog::new("Client", LogOptions::default());
        log.record(Direction::Send, "dropped", &events);

        log.set(LogOptions {
            log_to_events: true,
            log_to_console: false,
        });
        assert!(log.options().log_to_events);
        log.record(Direction::Receive, "kept", &events);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![(Direction::Receive, "kept".to_string())]
        );
    }

    #[test]
    fn console_lines_show_role_and_direction() {
        assert_eq!(
            console_line("Client", Direction::Send, r#"{"id":1,"method":"help"}"#),
            r#"Client > {"id":1,"method":"help"}"#
        );
        assert_eq!(
            console_line("Client", Direction::Receive, r#"{"id":1,"result":{}}"#),
            r#"Client < {"id":1,"result":{}}"#
        );
        assert_eq!(
            console_line("Server", Direction::Receive, r#"{"method":"dying"}"#),
            r#"Server < {"method":"dying"}"#
        );
        assert_eq!(
            console_line("Server", Direction::Send, r#"{"id":1,"result":{}}"#),
            r#"Server > {"id":1,"result":{}}"#
        );
    }
}
