pub mod errors;

pub use errors::{AmqpError, AmqpResult, ErrorCondition};
