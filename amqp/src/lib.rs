//! # Event Hubs AMQP core
//!
//! Transport and session management for an Event Hubs client: one physical
//! connection multiplexing named sessions and links, claims-based token
//! authorization with periodic renewal, and the correlated request/response
//! protocol behind the CBS and management nodes.
//!
//! ## Modules
//!
//! - [`auth`] - SAS tokens, connection strings, token providers and renewal
//! - [`channels`] - Request/response, CBS and management channels
//! - [`connection`] - Connection, session registry and connection processor
//! - [`session`] - Sessions and link creation
//! - [`link`] - Send and receive links
//! - [`event_loop`] - Single-task executor owning all protocol state
//! - [`transport`] - Frame-level transport seam and the in-memory broker
//! - [`endpoint`] - Endpoint state machine and observers
//! - [`scheduler`] - Timer scheduling for renewal
//! - [`events`] - Outcome notification streams
//! - [`message`] - Message model
//! - [`model`] - Entity and partition metadata
//! - [`config`] - Connection options
//! - [`utils`] - Environment helpers
//! - [`common`] - Error types

pub mod auth;
pub mod channels;
pub mod common;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod event_loop;
pub mod events;
pub mod link;
pub mod message;
pub mod model;
pub mod scheduler;
pub mod session;
pub mod transport;
pub mod utils;

pub use common::{AmqpError, AmqpResult};
pub use connection::{Connection, ConnectionConfig, ConnectionProcessor};
