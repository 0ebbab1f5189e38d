//! kubemux core types: watch/object identity, event descriptors and the
//! collaborator traits the dispatcher is written against.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

mod cache;
mod error;
mod handler;

pub use cache::{CacheFactory, Notification, NotificationSink, ResolvedResource, ResourceCache, ResourceResolver};
pub use error::{CacheError, DispatchError, ResolveError};
pub use handler::{handler_fn, Handler, HandlerFn};

/// Sequential identifier of a registered watch. Stable for the process lifetime.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchIndex(pub usize);

impl fmt::Display for WatchIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identity of an object within one collection: `namespace/name`, or `name` when cluster-scoped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey(String);

impl ObjectKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Build a key from metadata parts. An empty namespace is treated as cluster scope.
    pub fn from_parts(namespace: Option<&str>, name: &str) -> Self {
        match namespace {
            Some(ns) if !ns.is_empty() => Self(format!("{}/{}", ns, name)),
            _ => Self(name.to_string()),
        }
    }

    /// Inverse of [`ObjectKey::from_parts`].
    pub fn split(&self) -> (Option<&str>, &str) {
        match self.0.split_once('/') {
            Some((ns, name)) => (Some(ns), name),
            None => (None, self.0.as_str()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectKey {
    fn from(v: &str) -> Self {
        Self(v.to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Add,
    Update,
    Delete,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Add => "add",
            EventKind::Update => "update",
            EventKind::Delete => "delete",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An object addressed across watches. Two watches never collide on identical keys.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct WatchedKey {
    pub watch: WatchIndex,
    pub key: ObjectKey,
}

impl fmt::Display for WatchedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.watch, self.key)
    }
}

/// Queue item. Equal triples are the same item, which is what the queue deduplicates on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct EventDescriptor {
    pub watch: WatchIndex,
    pub key: ObjectKey,
    pub kind: EventKind,
}

impl EventDescriptor {
    pub fn new(watch: WatchIndex, key: ObjectKey, kind: EventKind) -> Self {
        Self { watch, key, kind }
    }

    pub fn watched_key(&self) -> WatchedKey {
        WatchedKey { watch: self.watch, key: self.key.clone() }
    }
}

impl fmt::Display for EventDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({} {} {})", self.watch, self.key, self.kind)
    }
}

/// What to watch: a group/version/kind plus optional scope filters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchSpec {
    /// `v1` or `group/version`
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    /// Label selector, applied server-side
    pub selector: Option<String>,
    /// Periodic resync; `None` disables it
    #[serde(default, with = "opt_secs")]
    pub resync: Option<std::time::Duration>,
}

impl WatchSpec {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { api_version: api_version.into(), kind: kind.into(), namespace: None, selector: None, resync: None }
    }

    /// Parse a `v1/Kind` or `group/v1/Kind` key.
    pub fn from_gvk_key(key: &str) -> Result<Self, DispatchError> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::new(*version, *kind)),
            [group, version, kind] if !group.is_empty() && !version.is_empty() && !kind.is_empty() => {
                Ok(Self::new(format!("{}/{}", group, version), *kind))
            }
            _ => Err(DispatchError::Configuration(format!(
                "invalid gvk key: {} (expect v1/Kind or group/v1/Kind)",
                key
            ))),
        }
    }

    pub fn namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = Some(ns.into());
        self
    }

    pub fn selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    pub fn resync(mut self, every: std::time::Duration) -> Self {
        self.resync = Some(every);
        self
    }
}

mod opt_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(v: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.filter(|s| *s > 0).map(Duration::from_secs))
    }
}

pub mod prelude {
    pub use super::{
        CacheFactory, DispatchError, EventDescriptor, EventKind, Handler, Notification, NotificationSink, ObjectKey,
        ResolvedResource, ResourceCache, ResourceResolver, WatchIndex, WatchSpec, WatchedKey,
    };
}
