// sysmgr-bus: local service bus for the system manager
//
// Services register under a well-known name, bind method tables to
// categories, and attach to a tokio runtime that runs their handlers.
// Requests are addressed with `luna://<service>/<category>/<method>` URIs
// and can arrive in-process (`ServiceBus::call`) or over a framed stream
// (`BusServer`).

mod protocol;
mod registry;
mod schema;
mod transport;

pub use protocol::*;
pub use registry::*;
pub use schema::*;
pub use transport::*;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("invalid service name: {0:?}")]
    InvalidServiceName(String),
    #[error("service already registered: {0}")]
    ServiceExists(String),
    #[error("service not registered: {0}")]
    ServiceNotFound(String),
    #[error("invalid category path: {0:?}")]
    InvalidCategory(String),
    #[error("category {0} has no methods")]
    EmptyCategory(String),
    #[error("category already registered: {0}")]
    CategoryExists(String),
    #[error("service already attached: {0}")]
    AlreadyAttached(String),
    #[error("service has no categories to attach: {0}")]
    NoCategories(String),
    #[error("service not attached: {0}")]
    NotAttached(String),
    #[error("invalid service uri: {0:?}")]
    InvalidUri(String),
    #[error("caller went away before the reply was sent")]
    ReplyFailed,
}

impl BusError {
    /// JSON-RPC error code used when this error is reported over the wire.
    pub fn rpc_code(&self) -> i32 {
        match self {
            BusError::InvalidUri(_) => INVALID_REQUEST,
            BusError::ServiceNotFound(_) | BusError::NotAttached(_) => METHOD_NOT_FOUND,
            _ => INTERNAL_ERROR,
        }
    }
}
