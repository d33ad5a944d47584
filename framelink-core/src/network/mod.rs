//! TCP sessions carrying framed envelopes.

pub mod connection;

pub use connection::{
    CloseReason, Connection, ConnectionInfo, ConnectionState, Role, SendMode,
};
