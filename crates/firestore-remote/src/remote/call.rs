//! Low-level call objects produced by a [`Connection`](super::Connection).
//!
//! Every event a call produces is posted to the datastore's completion queue
//! and delivered on the worker queue. Callbacks are never invoked from inside
//! the method that triggered them.

use bytes::Bytes;
use std::collections::BTreeMap;
use tonic::Status;

/// Response headers, keyed by lower-case header name.
pub type Metadata = BTreeMap<String, String>;

/// Receives the events of one bidirectional stream, on the worker queue.
pub trait GrpcStreamObserver: Send + Sync + 'static {
    /// The call is established and may be written to.
    fn on_stream_start(&self);

    fn on_stream_read(&self, message: Bytes);

    /// The previous write was handed to the transport.
    fn on_stream_write(&self);

    /// The call ended. Never delivered after [`GrpcStream::finish`].
    fn on_stream_finish(&self, status: Status);
}

/// A bidirectional streaming call.
pub trait GrpcStream: Send + 'static {
    fn start(&mut self);

    fn write(&mut self, message: Bytes);

    /// Writes a last message and half-closes the call. The observer hears
    /// nothing further.
    fn write_and_finish(&mut self, message: Bytes);

    /// Cancels the call. The observer hears nothing further.
    fn finish(&mut self);

    fn response_headers(&self) -> Metadata;
}

pub type UnaryCallback = Box<dyn FnOnce(Result<Bytes, Status>) + Send + 'static>;

/// A single-request, single-response call.
pub trait GrpcUnaryCall: Send + 'static {
    fn start(&mut self, request: Bytes, callback: UnaryCallback);

    /// Cancels the call without invoking its callback.
    fn finish_immediately(&mut self);

    fn response_headers(&self) -> Metadata;
}

pub type StreamingReaderCallback = Box<dyn FnOnce(Result<Vec<Bytes>, Status>) + Send + 'static>;

/// A server-streaming call whose responses are collected until the server
/// closes the stream.
pub trait GrpcStreamingReader: Send + 'static {
    fn start(&mut self, request: Bytes, callback: StreamingReaderCallback);

    /// Cancels the call without invoking its callback.
    fn finish_immediately(&mut self);

    fn response_headers(&self) -> Metadata;
}
