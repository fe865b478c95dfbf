//! Domain identifiers.
//!
//! Task ids are content-derived: the same listing link always maps to the same id,
//! which is what lets the dedup tracker recognise a re-sighting across runs.
//!
//! Process-scoped ids (workers, dispatch runs) are ULIDs behind a phantom-typed
//! `Id<T>` so a `WorkerId` can never be passed where a `DispatchId` is expected.

use std::fmt;
use std::marker::PhantomData;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::HarvestError;

/// Stable identifier of a task, derived from its target's path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Derive the id from a target URL: its last two non-empty path segments
    /// joined with `/`.
    ///
    /// Query string and fragment do not take part, so tracking parameters on a
    /// re-discovered link still resolve to the known id.
    pub fn from_target(target: &str) -> Result<Self, HarvestError> {
        let url = Url::parse(target)
            .map_err(|e| HarvestError::invalid_target(target, e.to_string()))?;

        let segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|seg| !seg.is_empty()).collect())
            .unwrap_or_default();

        match segments.as_slice() {
            [.., parent, leaf] => Ok(Self(format!("{parent}/{leaf}"))),
            _ => Err(HarvestError::invalid_target(
                target,
                "path needs at least two segments",
            )),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Marker trait for ULID-backed ids; supplies the display prefix.
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn generate() -> Self {
        Self::from_ulid(Ulid::new())
    }

    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Worker {}

impl IdMarker for Worker {
    fn prefix() -> &'static str {
        "worker-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Dispatch {}

impl IdMarker for Dispatch {
    fn prefix() -> &'static str {
        "dispatch-"
    }
}

/// Identifier of one worker process run (appears in every log line it emits).
pub type WorkerId = Id<Worker>;

/// Identifier of one dispatcher run.
pub type DispatchId = Id<Dispatch>;
