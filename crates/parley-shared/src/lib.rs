//! Types shared by the Parley relay server and its clients: identifiers,
//! the JSON wire protocol and protocol-level errors.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::ProtocolError;
