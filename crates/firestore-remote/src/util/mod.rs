//! Execution primitives shared by the transport.
//!
//! - [`async_queue`] - The serialized worker queue every protocol callback
//!   runs on.

pub mod async_queue;

pub use async_queue::{AsyncQueue, DelayedOperation};
