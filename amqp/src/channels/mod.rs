//! Request/response channels to the broker's control nodes.
//!
//! - [`request_response`] - generic correlated request/response
//! - [`cbs`] - token authorization on `$cbs`
//! - [`management`] - entity and partition metadata on `$management`

pub mod cbs;
pub mod management;
pub mod request_response;

pub use cbs::CbsChannel;
pub use management::ManagementChannel;
pub use request_response::RequestResponseChannel;
