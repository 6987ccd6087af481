//! Nimbus core types: the versioned object envelope and everything the store,
//! change feed and reconcilers exchange.

#![forbid(unsafe_code)]

pub mod coder;
pub mod error;
pub mod event;
pub mod filter;
pub mod object;
pub mod phase;
pub mod relation;
pub mod version;

pub use coder::CoderRegistry;
pub use error::{Error, Result};
pub use event::{Event, EventType, RawEvent};
pub use filter::Filter;
pub use object::{Metadata, Object, Origin, RawObject, Spec};
pub use phase::{Lifecycle, Phase};
pub use relation::{RelationKind, RelationSpec};
pub use version::Version;

pub mod prelude {
    pub use super::{
        CoderRegistry, Error, Event, EventType, Filter, Lifecycle, Metadata, Object, Origin, Phase, RawEvent,
        RawObject, RelationKind, RelationSpec, Result, Spec, Version,
    };
}

/// Milliseconds since the unix epoch, used for `created_at`/`updated_at`.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Fresh globally-unique object id.
pub fn new_uid() -> String {
    uuid::Uuid::new_v4().to_string()
}
