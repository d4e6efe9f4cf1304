//! Utility helpers shared by the connection configuration.
//!
//! - [`env`] - validated access to environment variables

pub mod env;

pub use env::{EnvUtils, EnvVarError};
