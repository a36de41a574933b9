//! Strongly-typed ULID identifiers.
//!
//! A single generic `Id<T>` carries the ULID; the marker type `T` only
//! exists at compile time, so a `TaskId` can never be passed where a
//! `ProfileId` is expected. ULIDs sort by creation time, which keeps
//! logs and exports readable.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// Marker trait for identifier kinds. Supplies the `Display` prefix.
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic identifier. `PhantomData<T>` costs nothing at runtime.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    /// Mint a fresh identifier.
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

/// Marker for tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task-"
    }
}

/// Marker for cloned execution profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Profile {}

impl IdMarker for Profile {
    fn prefix() -> &'static str {
        "profile-"
    }
}

/// Identifier of a submitted task.
pub type TaskId = Id<Task>;

/// Identifier of a cloned execution profile.
pub type ProfileId = Id<Profile>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_uses_prefix() {
        let task = TaskId::generate();
        let profile = ProfileId::generate();
        assert!(task.to_string().starts_with("task-"));
        assert!(profile.to_string().starts_with("profile-"));
    }

    #[test]
    fn ids_sort_by_creation_time() {
        let a = TaskId::generate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = TaskId::generate();
        assert!(a < b);
    }

    #[test]
    fn serde_round_trip() {
        let id = TaskId::generate();
        let json = serde_json::to_string(&id).unwrap();
        let back: TaskId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
