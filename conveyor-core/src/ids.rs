//! Identifier newtypes shared across the crate.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for one end-to-end pipeline run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl RunId {
    /// Mint a fresh, time-ordered run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Sentinel id used by the idle placeholder state before any run exists.
    pub fn nil() -> Self {
        Self(Uuid::nil())
    }

    /// True for the idle placeholder id.
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier handed to each event-bus subscriber.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct SubscriberId(pub Uuid);

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriberId {
    /// Mint a fresh subscriber identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
