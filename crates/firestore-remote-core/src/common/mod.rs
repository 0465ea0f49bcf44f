//! Types shared by every layer of the remote transport.
//!
//! - [`error`] - The unified [`Error`] type and its gRPC status mapping.
//! - [`types`] - Database identity and RPC names.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{
    DEFAULT_DATABASE_ID, DatabaseId, DatabaseInfo, RPC_NAME_COMMIT, RPC_NAME_LOOKUP,
    RPC_NAME_WRITE,
};
