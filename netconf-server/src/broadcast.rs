//! Notification streams (RFC 5277 §3.2).
//!
//! A stream is a named predicate over events plus a replay flag. Streams
//! that support replay keep a bounded log of the events published through
//! the server so that `create-subscription` with a `startTime` can replay
//! them.

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use netconf_protocol::message::notification;
use netconf_protocol::xml::Element;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// Name of the stream every server provides.
pub const DEFAULT_STREAM: &str = "NETCONF";

/// An event published to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationEvent {
    pub event_time: DateTime<Utc>,
    pub body: Element,
}

impl NotificationEvent {
    /// Creates an event, normalizing its timestamp to UTC.
    pub fn new<Tz: TimeZone>(event_time: DateTime<Tz>, body: Element) -> Self {
        Self {
            event_time: event_time.with_timezone(&Utc),
            body,
        }
    }

    /// Creates an event stamped with the current time.
    pub fn now(body: Element) -> Self {
        Self::new(Utc::now(), body)
    }

    pub fn to_element(&self) -> Element {
        notification(&self.event_time, self.body.clone())
    }
}

/// Decides whether an event belongs to a stream.
pub type StreamMatcher = Arc<dyn Fn(&NotificationEvent) -> bool + Send + Sync>;

/// Matches every event.
pub fn match_all() -> StreamMatcher {
    Arc::new(|_| true)
}

/// Matches events whose body element is in one of `namespaces`
/// (empty = all).
pub fn match_namespaces(namespaces: Vec<String>) -> StreamMatcher {
    Arc::new(move |event| {
        namespaces.is_empty()
            || event
                .body
                .ns
                .as_deref()
                .map_or(false, |ns| namespaces.iter().any(|n| n == ns))
    })
}

/// A registered stream.
pub struct Stream {
    name: String,
    matcher: StreamMatcher,
    replay: bool,
    log: Mutex<VecDeque<NotificationEvent>>,
    log_capacity: usize,
}

impl Stream {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn matches(&self, event: &NotificationEvent) -> bool {
        (self.matcher)(event)
    }

    pub fn supports_replay(&self) -> bool {
        self.replay
    }

    /// Events available for replay, oldest first.
    pub fn replay_log(&self) -> Vec<NotificationEvent> {
        self.log.lock().iter().cloned().collect()
    }

    fn record(&self, event: &NotificationEvent) {
        if !self.replay || self.log_capacity == 0 || !self.matches(event) {
            return;
        }
        let mut log = self.log.lock();
        if log.len() == self.log_capacity {
            log.pop_front();
        }
        log.push_back(event.clone());
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("name", &self.name)
            .field("replay", &self.replay)
            .finish_non_exhaustive()
    }
}

/// Stream name to stream.
pub struct StreamRegistry {
    streams: DashMap<String, Arc<Stream>>,
    log_capacity: usize,
}

impl StreamRegistry {
    /// Creates a registry holding the default `NETCONF` stream, which
    /// matches everything and does not support replay.
    pub fn new(log_capacity: usize) -> Self {
        let registry = Self {
            streams: DashMap::new(),
            log_capacity,
        };
        registry.register(DEFAULT_STREAM, match_all(), false);
        registry
    }

    /// Registers or replaces a stream.
    pub fn register(&self, name: impl Into<String>, matcher: StreamMatcher, replay: bool) {
        let name = name.into();
        tracing::debug!("Registered stream '{}' (replay: {})", name, replay);
        let stream = Arc::new(Stream {
            name: name.clone(),
            matcher,
            replay,
            log: Mutex::new(VecDeque::new()),
            log_capacity: self.log_capacity,
        });
        self.streams.insert(name, stream);
    }

    pub fn get(&self, name: &str) -> Option<Arc<Stream>> {
        self.streams.get(name).map(|s| s.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.streams.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.streams.iter().map(|s| s.key().clone()).collect();
        names.sort();
        names
    }

    /// Appends `event` to the replay log of every replay stream it matches.
    pub fn record(&self, event: &NotificationEvent) {
        for stream in self.streams.iter() {
            stream.record(event);
        }
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;

    fn event(ns: &str, name: &str) -> NotificationEvent {
        NotificationEvent::now(Element::new_ns(ns, name))
    }

    #[test]
    fn test_default_stream() {
        let registry = StreamRegistry::default();
        let stream = registry.get(DEFAULT_STREAM).unwrap();
        assert!(!stream.supports_replay());
        assert!(stream.matches(&event("urn:any", "thing")));
        assert_eq!(registry.names(), vec![DEFAULT_STREAM.to_string()]);
    }

    #[test]
    fn test_timestamp_normalized_to_utc() {
        let offset = FixedOffset::east_opt(2 * 3600).unwrap();
        let local = offset.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let ev = NotificationEvent::new(local, Element::new("tick"));
        assert_eq!(ev.event_time, Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap());

        let el = ev.to_element();
        assert_eq!(el.child("eventTime").unwrap().text(), "2024-05-01T10:00:00Z");
    }

    #[test]
    fn test_namespace_matcher() {
        let matcher = match_namespaces(vec!["urn:a".into()]);
        assert!(matcher(&event("urn:a", "x")));
        assert!(!matcher(&event("urn:b", "x")));
        assert!(match_namespaces(Vec::new())(&event("urn:b", "x")));
    }

    #[test]
    fn test_replay_log_is_bounded_and_filtered() {
        let registry = StreamRegistry::new(2);
        registry.register("alarms", match_namespaces(vec!["urn:alarm".into()]), true);

        registry.record(&event("urn:alarm", "one"));
        registry.record(&event("urn:other", "skipped"));
        registry.record(&event("urn:alarm", "two"));
        registry.record(&event("urn:alarm", "three"));

        let names: Vec<String> = registry
            .get("alarms")
            .unwrap()
            .replay_log()
            .into_iter()
            .map(|e| e.body.name)
            .collect();
        assert_eq!(names, vec!["two", "three"]);
        assert!(registry.get(DEFAULT_STREAM).unwrap().replay_log().is_empty());
    }
}
