use serde::{Deserialize, Serialize};

use crate::object::RawObject;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventType::Added => "ADDED",
            EventType::Modified => "MODIFIED",
            EventType::Deleted => "DELETED",
        };
        f.write_str(s)
    }
}

/// Unit produced by both the change feed and execution-cluster watches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event<T> {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub object: T,
}

pub type RawEvent = Event<RawObject>;

impl<T> Event<T> {
    pub fn new(event_type: EventType, object: T) -> Self {
        Self { event_type, object }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Event<U> {
        Event { event_type: self.event_type, object: f(self.object) }
    }
}
