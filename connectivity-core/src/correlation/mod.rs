//! Request/response correlation over asynchronous transports

pub mod pending;
pub mod registry;

pub use pending::{PendingRequest, RequestStatus};
pub use registry::RequestRegistry;
