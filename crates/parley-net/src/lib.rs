// Client transport to the Parley relay over a WebSocket.

pub mod connection;

pub use connection::{socket_url, spawn_connection, ConnectError, ConnectionNotification};
