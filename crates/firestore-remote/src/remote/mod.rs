//! Client-side RPC machinery.
//!
//! ## Structure
//!
//! - [`completion_queue`] - Completion delivery from network tasks.
//! - [`call`] / [`connection`] - Call abstractions and the channel that builds them.
//! - [`datastore`] - Token injection, unary calls, stream factory, shutdown.
//! - [`stream`] - Reconnecting stream lifecycle, generic over a protocol.
//! - [`write_stream`] - Handshake-then-mutations write protocol.
//! - [`serializer`] - Domain model to wire message translation.
//! - [`backoff`] - Reconnection delay policy.

pub mod backoff;
pub mod call;
pub mod codec;
pub mod completion_queue;
pub mod connection;
pub mod datastore;
pub mod serializer;
pub mod stream;
mod tonic_call;
pub mod write_stream;

#[cfg(test)]
pub(crate) mod testing;

pub use backoff::{BackoffPolicy, ExponentialBackoff};
pub use call::{GrpcStream, GrpcStreamObserver, GrpcStreamingReader, GrpcUnaryCall, Metadata};
pub use completion_queue::{Completion, CompletionQueue, PendingOp};
pub use connection::{Connection, GrpcConnection};
pub use datastore::Datastore;
pub use serializer::{RemoteSerializer, Serializer};
pub use stream::{Stream, StreamProtocol, StreamState};
pub use tonic_call::{TonicStream, TonicStreamingReader, TonicUnaryCall};
pub use write_stream::{WriteStream, WriteStreamDelegate, WriteStreamEvent};
