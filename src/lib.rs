pub mod config;
pub mod connection;
pub mod control;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod message;
pub mod pubsub;
pub mod server;
