//! Identity types for tabsync.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The logical name of a replicated table.
///
/// A 4-tuple used purely as a routing key: both peers must agree on the
/// record layout behind it out of band.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableId {
    /// Database name.
    pub database: String,
    /// Period partition (e.g. `D1`, `M15`, `RT`).
    pub period: String,
    /// Data source.
    pub source: String,
    /// Table name within the source.
    pub tablename: String,
}

impl TableId {
    /// Create a TableId from its four components.
    pub fn new(database: &str, period: &str, source: &str, tablename: &str) -> Self {
        Self {
            database: database.to_string(),
            period: period.to_string(),
            source: source.to_string(),
            tablename: tablename.to_string(),
        }
    }

    /// Name of the first empty component, if any.
    pub fn missing_component(&self) -> Option<&'static str> {
        [
            ("database", &self.database),
            ("period", &self.period),
            ("source", &self.source),
            ("tablename", &self.tablename),
        ]
        .into_iter()
        .find(|(_, value)| value.is_empty())
        .map(|(name, _)| name)
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.database, self.period, self.source, self.tablename
        )
    }
}

impl fmt::Debug for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TableId({self})")
    }
}

/// Process-local identifier of a live session.
///
/// Assigned by the server at accept time; never sent on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct SessionId(u64);

impl SessionId {
    /// Create a SessionId from a raw value.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the raw value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
