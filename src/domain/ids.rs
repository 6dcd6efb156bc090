//! Identifier and small scalar newtypes shared across every component.

use nutype::nutype;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Server-assigned identity of a submitted task. Stable for the task's lifetime.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generates a fresh random task id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Identity claimed by a worker agent at registration time.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct AgentId(Uuid);

impl AgentId {
    /// Generates a fresh random agent id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Server-side handle for a single transport connection.
///
/// A weak reference: it outlives neither the connection nor any particular
/// agent record, and is never used to extend either's lifetime.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generates a fresh random connection id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Identity of a routing rule, used for enable/disable/remove by id.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct RoutingRuleId(Uuid);

impl RoutingRuleId {
    /// Generates a fresh random routing rule id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Identity of a recorded error context.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct ErrorContextId(Uuid);

impl ErrorContextId {
    /// Generates a fresh random error context id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// A single capability tag an agent advertises or a task requires.
#[nutype(
    validate(len_char_min = 1, len_char_max = 100),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct Capability(String);

/// Milliseconds since the Unix epoch, stamped by the server. Workers' own
/// timestamps are never trusted for ordering (§9 Clocks).
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    Into
))]
pub struct Timestamp(i64);

impl Timestamp {
    /// Stamps the current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self::new(i64::try_from(millis).unwrap_or(i64::MAX))
    }

    /// Elapsed milliseconds between `self` and `other`, saturating at zero
    /// when `other` precedes `self`.
    #[must_use]
    pub fn elapsed_ms_since(&self, other: Self) -> u64 {
        u64::try_from(self.into_inner().saturating_sub(other.into_inner())).unwrap_or(0)
    }
}
