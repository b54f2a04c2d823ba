//! # tabsync-types
//!
//! Wire message types for the tabsync table replication protocol.
//!
//! This crate provides the types exchanged before any framed data flows:
//! - [`TableId`] - The routing key of a replicated table
//! - [`Declaration`] - The initiator's opening message (token, action, state)
//! - [`StateReply`] - The receiver's answer to a `publish` declaration
//! - [`MessageError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod ids;
mod messages;

pub use error::MessageError;
pub use ids::{SessionId, TableId};
pub use messages::{
    Action, Declaration, StateReply, SubscribeParams, CONTAINER_TABLE, DEFAULT_BANDWIDTH,
    DEFAULT_LOOKBACK_LINES, MAX_MESSAGE_SIZE,
};
