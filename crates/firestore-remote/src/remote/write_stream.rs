//! The write protocol.
//!
//! Every connection begins with a handshake: the client sends a request that
//! names only the database, and the server answers with a stream token. Only
//! then may mutation batches be sent, each carrying the latest token. Every
//! acknowledgement returns a new token plus one result per mutation.
//!
//! The token survives reconnects within the process; persisting it across
//! restarts is up to the caller ([`WriteStream::last_stream_token`] /
//! [`WriteStream::set_last_stream_token`]).

use super::{
    backoff::{BackoffPolicy, ExponentialBackoff},
    call::{GrpcStream, GrpcStreamObserver},
    datastore::Datastore,
    serializer::Serializer,
    stream::{Stream, StreamProtocol, StreamState},
};
use crate::{auth::Token, telemetry};
use bytes::Bytes;
use firestore_remote_core::{
    Error, RPC_NAME_WRITE, Result,
    model::{Mutation, MutationResult, SnapshotVersion},
};
use std::sync::Arc;
use tonic::Status;

/// Receives write-stream events on the worker queue.
pub trait WriteStreamDelegate: Send + Sync + 'static {
    /// The call is open. The handshake has not been sent yet.
    fn on_write_stream_open(&self);

    fn on_write_stream_handshake_complete(&self);

    /// A mutation batch was acknowledged.
    fn on_write_stream_mutation_result(
        &self,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
    );

    /// The stream closed. Decide here whether to start it again.
    fn on_write_stream_close(&self, status: Status);
}

#[derive(Clone, Debug)]
pub enum WriteStreamEvent {
    Open,
    HandshakeComplete,
    MutationResult {
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
    },
    Closed(Status),
}

pub struct WriteProtocol {
    serializer: Arc<dyn Serializer>,
    handshake_complete: bool,
    last_stream_token: Bytes,
}

impl WriteProtocol {
    pub fn new(serializer: Arc<dyn Serializer>) -> Self {
        Self {
            serializer,
            handshake_complete: false,
            last_stream_token: Bytes::new(),
        }
    }
}

impl StreamProtocol for WriteProtocol {
    type Delegate = dyn WriteStreamDelegate;
    type Event = WriteStreamEvent;

    const DEBUG_NAME: &'static str = "WriteStream";

    fn create_call(
        &mut self,
        datastore: &Datastore,
        token: &Token,
        observer: Arc<dyn GrpcStreamObserver>,
    ) -> Box<dyn GrpcStream> {
        datastore.create_stream(RPC_NAME_WRITE, token, observer)
    }

    fn finish_call(&mut self, mut call: Box<dyn GrpcStream>) {
        if self.handshake_complete {
            // Let the server know where we left off before hanging up.
            let request = self
                .serializer
                .encode_write_mutations(&[], &self.last_stream_token);
            call.write_and_finish(request);
        } else {
            call.finish();
        }
    }

    fn on_stream_start(&mut self) -> Option<WriteStreamEvent> {
        Some(WriteStreamEvent::Open)
    }

    fn on_stream_read(
        &mut self,
        message: &[u8],
        backoff: &mut dyn BackoffPolicy,
    ) -> Result<Option<WriteStreamEvent>> {
        let response = self.serializer.decode_write_response(message)?;

        if !self.handshake_complete {
            if !response.mutation_results.is_empty() {
                return Err(Error::InvalidResponse {
                    reason: "handshake response carried write results".to_string(),
                });
            }
            self.last_stream_token = response.stream_token;
            self.handshake_complete = true;
            return Ok(Some(WriteStreamEvent::HandshakeComplete));
        }

        self.last_stream_token = response.stream_token;
        backoff.reset();
        telemetry::increment_write_acks();
        Ok(Some(WriteStreamEvent::MutationResult {
            commit_version: response.commit_version,
            results: response.mutation_results,
        }))
    }

    fn on_stream_finish(&mut self, status: &Status) -> Option<WriteStreamEvent> {
        self.handshake_complete = false;
        Some(WriteStreamEvent::Closed(status.clone()))
    }

    fn dispatch(delegate: &dyn WriteStreamDelegate, event: WriteStreamEvent) {
        match event {
            WriteStreamEvent::Open => delegate.on_write_stream_open(),
            WriteStreamEvent::HandshakeComplete => delegate.on_write_stream_handshake_complete(),
            WriteStreamEvent::MutationResult {
                commit_version,
                results,
            } => delegate.on_write_stream_mutation_result(commit_version, results),
            WriteStreamEvent::Closed(status) => delegate.on_write_stream_close(status),
        }
    }
}

/// A reconnecting stream speaking the write protocol.
///
/// Cloning yields another handle to the same stream.
#[derive(Clone)]
pub struct WriteStream {
    stream: Stream<WriteProtocol>,
}

impl WriteStream {
    pub fn new(datastore: &Arc<Datastore>, delegate: Arc<dyn WriteStreamDelegate>) -> Self {
        Self::with_backoff(
            datastore,
            delegate,
            Box::new(ExponentialBackoff::default()),
        )
    }

    pub fn with_backoff(
        datastore: &Arc<Datastore>,
        delegate: Arc<dyn WriteStreamDelegate>,
        backoff: Box<dyn BackoffPolicy>,
    ) -> Self {
        let protocol = WriteProtocol::new(Arc::clone(datastore.serializer()));
        Self {
            stream: Stream::with_backoff(Arc::clone(datastore), protocol, delegate, backoff),
        }
    }

    pub fn start(&self) {
        self.stream.start();
    }

    pub fn stop(&self) {
        self.stream.stop();
    }

    pub fn state(&self) -> StreamState {
        self.stream.state()
    }

    pub fn is_started(&self) -> bool {
        self.stream.is_started()
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_open()
    }

    /// Sends the handshake. Must be the first write on every connection.
    ///
    /// # Panics
    ///
    /// If the stream is not open, or the handshake already completed.
    pub fn write_handshake(&self) {
        tracing::debug!("Sending write stream handshake");
        self.stream.write_with(|protocol| {
            assert!(
                !protocol.handshake_complete,
                "handshake already completed on this connection"
            );
            protocol.serializer.encode_handshake()
        });
    }

    /// Sends one mutation batch resuming from the last stream token.
    ///
    /// # Panics
    ///
    /// If the handshake has not completed on this connection.
    pub fn write_mutations(&self, mutations: &[Mutation]) {
        tracing::debug!(mutations = mutations.len(), "Sending mutation batch");
        self.stream.write_with(|protocol| {
            assert!(
                protocol.handshake_complete,
                "mutations written before the handshake completed"
            );
            protocol
                .serializer
                .encode_write_mutations(mutations, &protocol.last_stream_token)
        });
    }

    pub fn is_handshake_complete(&self) -> bool {
        self.stream.with_protocol(|protocol| protocol.handshake_complete)
    }

    pub fn last_stream_token(&self) -> Bytes {
        self.stream
            .with_protocol(|protocol| protocol.last_stream_token.clone())
    }

    /// Restores a token persisted by an earlier session.
    pub fn set_last_stream_token(&self, token: Bytes) {
        self.stream
            .with_protocol(|protocol| protocol.last_stream_token = token);
    }
}
