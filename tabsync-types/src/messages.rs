//! Handshake messages for tabsync.
//!
//! Both messages travel as compact JSON objects with no length prefix. JSON
//! is self-delimiting, so a reader can stop at the closing brace and hand any
//! trailing bytes to the frame decoder.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::{MessageError, TableId};

/// The only container kind the protocol replicates.
pub const CONTAINER_TABLE: &str = "table";

/// Default number of trailing rows a subscriber asks for.
pub const DEFAULT_LOOKBACK_LINES: u64 = 1000;

/// Default negotiated bandwidth ceiling in bytes per second.
pub const DEFAULT_BANDWIDTH: u64 = 1_000_000;

/// Maximum size of a text message (declaration or state reply).
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// What the initiator wants to do with the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Receive the table from the responder.
    Subscribe,
    /// Push updates into the responder's table.
    Publish,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Subscribe => write!(f, "subscribe"),
            Action::Publish => write!(f, "publish"),
        }
    }
}

/// Catch-up parameters carried by a `subscribe` declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeParams {
    /// Trailing rows to send when no date is given.
    pub lookback_lines: u64,
    /// Start the window at the first row on or after this date.
    pub lookback_date: Option<NaiveDate>,
    /// Resend the whole window once before switching to incremental mode.
    pub snapshot: bool,
    /// Bandwidth ceiling in bytes per second.
    pub bandwidth: u64,
}

impl Default for SubscribeParams {
    fn default() -> Self {
        Self {
            lookback_lines: DEFAULT_LOOKBACK_LINES,
            lookback_date: None,
            snapshot: false,
            bandwidth: DEFAULT_BANDWIDTH,
        }
    }
}

/// Opening message of every session, sent once by the initiator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Declaration {
    /// Authentication token.
    pub token: String,
    /// Requested action.
    pub action: Action,
    /// Target table.
    #[serde(flatten)]
    pub table: TableId,
    /// Container kind, always `table`.
    pub container: String,
    /// Initiator's current row count.
    pub count: u64,
    /// Initiator's latest modification time (Unix seconds).
    pub mtime: f64,
    /// Trailing rows to send (subscribe).
    #[serde(default = "default_lookback_lines")]
    pub lookbacklines: u64,
    /// Window start date (subscribe).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookbackdate: Option<NaiveDate>,
    /// Snapshot request (subscribe).
    #[serde(default)]
    pub snapshot: bool,
    /// Bandwidth ceiling in bytes per second.
    #[serde(default = "default_bandwidth")]
    pub bandwidth: u64,
}

fn default_lookback_lines() -> u64 {
    DEFAULT_LOOKBACK_LINES
}

fn default_bandwidth() -> u64 {
    DEFAULT_BANDWIDTH
}

impl Declaration {
    /// Build a `subscribe` declaration.
    pub fn subscribe(
        token: String,
        table: TableId,
        count: u64,
        mtime: f64,
        params: &SubscribeParams,
    ) -> Self {
        Self {
            token,
            action: Action::Subscribe,
            table,
            container: CONTAINER_TABLE.to_string(),
            count,
            mtime,
            lookbacklines: params.lookback_lines,
            lookbackdate: params.lookback_date,
            snapshot: params.snapshot,
            bandwidth: params.bandwidth,
        }
    }

    /// Build a `publish` declaration.
    pub fn publish(token: String, table: TableId, count: u64, mtime: f64, bandwidth: u64) -> Self {
        Self {
            token,
            action: Action::Publish,
            table,
            container: CONTAINER_TABLE.to_string(),
            count,
            mtime,
            lookbacklines: DEFAULT_LOOKBACK_LINES,
            lookbackdate: None,
            snapshot: false,
            bandwidth,
        }
    }

    /// The catch-up parameters of this declaration.
    pub fn subscribe_params(&self) -> SubscribeParams {
        SubscribeParams {
            lookback_lines: self.lookbacklines,
            lookback_date: self.lookbackdate,
            snapshot: self.snapshot,
            bandwidth: self.bandwidth,
        }
    }

    /// Check the structural fields the responder relies on.
    pub fn validate(&self) -> Result<(), MessageError> {
        if self.container != CONTAINER_TABLE {
            return Err(MessageError::UnsupportedContainer(self.container.clone()));
        }
        if self.token.is_empty() {
            return Err(MessageError::MissingField("token"));
        }
        if let Some(field) = self.table.missing_component() {
            return Err(MessageError::MissingField(field));
        }
        Ok(())
    }

    /// Serialize to compact JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        serde_json::to_vec(self).map_err(MessageError::Serialization)
    }

    /// Deserialize from JSON bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MessageError> {
        serde_json::from_slice(bytes).map_err(MessageError::Deserialization)
    }
}

/// The receiver's current table state, sent in reply to `publish`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StateReply {
    /// Latest modification time (Unix seconds).
    pub mtime: f64,
    /// Current row count.
    pub count: u64,
}

impl StateReply {
    /// Serialize to compact JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        serde_json::to_vec(self).map_err(MessageError::Serialization)
    }

    /// Deserialize from JSON bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MessageError> {
        serde_json::from_slice(bytes).map_err(MessageError::Deserialization)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> TableId {
        TableId::new("MarketData", "D1", "YFinance", "AAPL")
    }

    #[test]
    fn subscribe_declaration_uses_flat_wire_keys() {
        let params = SubscribeParams {
            lookback_lines: 500,
            lookback_date: NaiveDate::from_ymd_opt(2024, 3, 1),
            snapshot: true,
            bandwidth: 2_000_000,
        };
        let decl = Declaration::subscribe("tok".into(), table(), 42, 1.5, &params);
        let value: serde_json::Value = serde_json::from_slice(&decl.to_bytes().unwrap()).unwrap();

        assert_eq!(value["action"], "subscribe");
        assert_eq!(value["database"], "MarketData");
        assert_eq!(value["period"], "D1");
        assert_eq!(value["source"], "YFinance");
        assert_eq!(value["tablename"], "AAPL");
        assert_eq!(value["container"], "table");
        assert_eq!(value["count"], 42);
        assert_eq!(value["mtime"], 1.5);
        assert_eq!(value["lookbacklines"], 500);
        assert_eq!(value["lookbackdate"], "2024-03-01");
        assert_eq!(value["snapshot"], true);
        assert_eq!(value["bandwidth"], 2_000_000);
    }

    #[test]
    fn declaration_is_newline_free() {
        let decl = Declaration::publish("tok".into(), table(), 0, 0.0, DEFAULT_BANDWIDTH);
        let bytes = decl.to_bytes().unwrap();
        assert!(!bytes.contains(&b'\n'));
    }

    #[test]
    fn missing_optional_fields_take_defaults() {
        let json = br#"{"token":"t","action":"subscribe","database":"db","period":"D1",
            "source":"s","container":"table","tablename":"x","count":0,"mtime":0}"#;
        let decl = Declaration::from_bytes(json).unwrap();
        let params = decl.subscribe_params();
        assert_eq!(params.lookback_lines, DEFAULT_LOOKBACK_LINES);
        assert_eq!(params.lookback_date, None);
        assert!(!params.snapshot);
        assert_eq!(params.bandwidth, DEFAULT_BANDWIDTH);
        assert_eq!(decl.mtime, 0.0);
    }

    #[test]
    fn validate_rejects_foreign_container() {
        let mut decl = Declaration::publish("tok".into(), table(), 0, 0.0, DEFAULT_BANDWIDTH);
        assert!(decl.validate().is_ok());

        decl.container = "timeseries".into();
        assert!(matches!(
            decl.validate(),
            Err(MessageError::UnsupportedContainer(_))
        ));
    }

    #[test]
    fn validate_rejects_empty_components() {
        let mut decl = Declaration::publish(String::new(), table(), 0, 0.0, DEFAULT_BANDWIDTH);
        assert!(matches!(
            decl.validate(),
            Err(MessageError::MissingField("token"))
        ));

        decl.token = "tok".into();
        decl.table.source.clear();
        assert!(matches!(
            decl.validate(),
            Err(MessageError::MissingField("source"))
        ));
    }

    #[test]
    fn unknown_action_is_rejected() {
        let json = br#"{"token":"t","action":"delete","database":"db","period":"D1",
            "source":"s","container":"table","tablename":"x","count":0,"mtime":0}"#;
        assert!(Declaration::from_bytes(json).is_err());
    }

    #[test]
    fn state_reply_decodes() {
        let reply = StateReply::from_bytes(br#"{"mtime":1700000000.25,"count":2500}"#).unwrap();
        assert_eq!(reply.count, 2500);
        assert_eq!(reply.mtime, 1_700_000_000.25);
    }
}
