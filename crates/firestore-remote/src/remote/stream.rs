//! Generic lifecycle of a bidirectional streaming RPC.
//!
//! [`Stream`] owns *when* to connect, reconnect and give up; a
//! [`StreamProtocol`] owns *what* the messages mean. The write stream is one
//! such protocol; any other streaming RPC plugs into the same engine.
//!
//! ## States
//!
//! ```text
//! Initial --start--> Starting --call started--> Open
//!                       ^                         |
//!                       |  start (after backoff)  | error / server close
//!                       +-------- Error <---------+
//!
//! any --stop--> Closed (terminal)
//! ```
//!
//! Every connection attempt bumps a generation counter. Callbacks carry the
//! generation they were created for and are ignored once it is stale, so a
//! call that was torn down can never reach into its successor.
//!
//! All methods must run on the worker queue. Delegate notifications are
//! issued after the stream's internal lock is released, so a delegate may
//! call straight back into the stream.

use super::{
    backoff::{BackoffPolicy, ExponentialBackoff},
    call::{GrpcStream, GrpcStreamObserver},
    datastore::Datastore,
};
use crate::{auth::Token, telemetry, util::DelayedOperation};
use bytes::Bytes;
use firestore_remote_core::{Error, Result};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tonic::{Code, Status};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    /// Never started.
    Initial,
    /// Waiting for a backoff delay, a token, or the call to start.
    Starting,
    Open,
    /// The last call failed; `start` may reconnect.
    Error,
    /// Stopped for good.
    Closed,
}

/// The protocol-specific half of a stream.
pub trait StreamProtocol: Send + 'static {
    type Delegate: ?Sized + Send + Sync + 'static;
    type Event: Send + 'static;

    const DEBUG_NAME: &'static str;

    fn create_call(
        &mut self,
        datastore: &Datastore,
        token: &Token,
        observer: Arc<dyn GrpcStreamObserver>,
    ) -> Box<dyn GrpcStream>;

    /// Releases a call that is still running.
    fn finish_call(&mut self, call: Box<dyn GrpcStream>);

    fn on_stream_start(&mut self) -> Option<Self::Event>;

    /// Handles one inbound message. An error tears the call down as if the
    /// transport had failed.
    fn on_stream_read(
        &mut self,
        message: &[u8],
        backoff: &mut dyn BackoffPolicy,
    ) -> Result<Option<Self::Event>>;

    fn on_stream_finish(&mut self, status: &Status) -> Option<Self::Event>;

    fn dispatch(delegate: &Self::Delegate, event: Self::Event);
}

struct StreamCore<P> {
    state: StreamState,
    generation: u64,
    call: Option<Box<dyn GrpcStream>>,
    write_in_flight: bool,
    backoff: Box<dyn BackoffPolicy>,
    pending_restart: Option<DelayedOperation>,
    protocol: P,
}

struct StreamInner<P: StreamProtocol> {
    datastore: Arc<Datastore>,
    delegate: Arc<P::Delegate>,
    core: Mutex<StreamCore<P>>,
}

/// A reconnecting bidirectional stream driven by protocol `P`.
pub struct Stream<P: StreamProtocol> {
    inner: Arc<StreamInner<P>>,
}

impl<P: StreamProtocol> Clone for Stream<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: StreamProtocol> Stream<P> {
    pub fn new(datastore: Arc<Datastore>, protocol: P, delegate: Arc<P::Delegate>) -> Self {
        Self::with_backoff(
            datastore,
            protocol,
            delegate,
            Box::new(ExponentialBackoff::default()),
        )
    }

    pub fn with_backoff(
        datastore: Arc<Datastore>,
        protocol: P,
        delegate: Arc<P::Delegate>,
        backoff: Box<dyn BackoffPolicy>,
    ) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                datastore,
                delegate,
                core: Mutex::new(StreamCore {
                    state: StreamState::Initial,
                    generation: 0,
                    call: None,
                    write_in_flight: false,
                    backoff,
                    pending_restart: None,
                    protocol,
                }),
            }),
        }
    }

    pub fn state(&self) -> StreamState {
        self.inner.core.lock().state
    }

    /// Starting or open.
    pub fn is_started(&self) -> bool {
        matches!(self.state(), StreamState::Starting | StreamState::Open)
    }

    pub fn is_open(&self) -> bool {
        self.state() == StreamState::Open
    }

    /// Connects. From `Initial` the token is requested right away; from
    /// `Error` only after the backoff delay.
    ///
    /// # Panics
    ///
    /// If the stream is already started or has been stopped.
    pub fn start(&self) {
        self.inner.verify_is_current_queue();
        let mut core = self.inner.core.lock();

        let state = core.state;
        match state {
            StreamState::Initial => {
                core.state = StreamState::Starting;
                core.generation += 1;
                let generation = core.generation;
                drop(core);

                tracing::debug!(stream = P::DEBUG_NAME, generation, "Starting stream");
                self.inner.request_token(generation);
            }
            StreamState::Error => {
                core.state = StreamState::Starting;
                core.generation += 1;
                let generation = core.generation;
                let delay = core.backoff.next_delay();

                tracing::debug!(stream = P::DEBUG_NAME, generation, ?delay, "Restarting stream after backoff");
                telemetry::increment_stream_restarts();

                let inner = Arc::downgrade(&self.inner);
                let restart = self
                    .inner
                    .datastore
                    .worker_queue()
                    .enqueue_after_delay(delay, move || {
                        if let Some(inner) = inner.upgrade() {
                            inner.on_backoff_elapsed(generation);
                        }
                    });
                core.pending_restart = Some(restart);
            }
            state => panic!("{} cannot start from {state:?}", P::DEBUG_NAME),
        }
    }

    /// Tears down the current call, if any, and closes the stream for good.
    ///
    /// A stream that was starting or open reports an OK finish to its
    /// protocol.
    pub fn stop(&self) {
        self.inner.verify_is_current_queue();
        let mut core = self.inner.core.lock();
        if core.state == StreamState::Closed {
            return;
        }

        let was_open = core.state == StreamState::Open;
        let was_active = matches!(core.state, StreamState::Starting | StreamState::Open);

        if let Some(restart) = core.pending_restart.take() {
            restart.cancel();
        }
        if let Some(call) = core.call.take() {
            core.protocol.finish_call(call);
        }
        core.state = StreamState::Closed;
        core.generation += 1;
        core.write_in_flight = false;
        if was_open {
            telemetry::decrement_streams_open();
        }

        let event = if was_active {
            core.protocol.on_stream_finish(&Status::new(Code::Ok, ""))
        } else {
            None
        };
        drop(core);

        tracing::debug!(stream = P::DEBUG_NAME, "Stream stopped");
        self.inner.dispatch(event);
    }

    /// Sends the message produced by `encode`.
    ///
    /// # Panics
    ///
    /// If the stream is not open or a previous write has not been
    /// acknowledged yet.
    pub fn write_with<F>(&self, encode: F)
    where
        F: FnOnce(&mut P) -> Bytes,
    {
        self.inner.verify_is_current_queue();
        let mut core = self.inner.core.lock();
        assert!(
            core.state == StreamState::Open,
            "{} written to while {:?}",
            P::DEBUG_NAME,
            core.state
        );
        assert!(
            !core.write_in_flight,
            "{} written to with a write still outstanding",
            P::DEBUG_NAME
        );

        let message = encode(&mut core.protocol);
        core.write_in_flight = true;
        if let Some(call) = core.call.as_mut() {
            call.write(message);
        }
    }

    /// Runs `f` against the protocol state.
    pub fn with_protocol<R>(&self, f: impl FnOnce(&mut P) -> R) -> R {
        f(&mut self.inner.core.lock().protocol)
    }
}

impl<P: StreamProtocol> StreamInner<P> {
    fn verify_is_current_queue(&self) {
        self.datastore.worker_queue().verify_is_current_queue();
    }

    fn dispatch(&self, event: Option<P::Event>) {
        if let Some(event) = event {
            P::dispatch(&self.delegate, event);
        }
    }

    fn request_token(self: &Arc<Self>, generation: u64) {
        let inner = Arc::downgrade(self);
        self.datastore.with_token(move |token| {
            if let Some(inner) = inner.upgrade() {
                inner.on_token(generation, token);
            }
        });
    }

    fn on_backoff_elapsed(self: &Arc<Self>, generation: u64) {
        {
            let mut core = self.core.lock();
            if core.generation != generation || core.state != StreamState::Starting {
                return;
            }
            core.pending_restart = None;
        }
        self.request_token(generation);
    }

    fn on_token(self: &Arc<Self>, generation: u64, token: Result<Token>) {
        let mut core = self.core.lock();
        if core.generation != generation || core.state != StreamState::Starting {
            tracing::trace!(stream = P::DEBUG_NAME, generation, "Ignoring stale token");
            return;
        }

        // The datastore can shut down while the token request is outstanding.
        let token = if self.datastore.is_shut_down() {
            Err(Error::ServiceShutdown)
        } else {
            token
        };

        match token {
            Ok(token) => {
                let observer: Arc<dyn GrpcStreamObserver> = Arc::new(CallObserver {
                    stream: Arc::downgrade(self),
                    generation,
                });
                let mut call = core.protocol.create_call(&self.datastore, &token, observer);
                call.start();
                core.call = Some(call);
            }
            Err(e) => {
                tracing::debug!(stream = P::DEBUG_NAME, error = %e, "Token fetch failed");
                let event = self.close(&mut core, Status::from(e));
                drop(core);
                self.dispatch(event);
            }
        }
    }

    fn on_call_start(&self, generation: u64) {
        let mut core = self.core.lock();
        if core.generation != generation || core.state != StreamState::Starting {
            return;
        }

        core.state = StreamState::Open;
        telemetry::increment_streams_open();
        let event = core.protocol.on_stream_start();
        drop(core);

        tracing::debug!(stream = P::DEBUG_NAME, generation, "Stream open");
        self.dispatch(event);
    }

    fn on_call_read(&self, generation: u64, message: Bytes) {
        let event = {
            let mut guard = self.core.lock();
            if guard.generation != generation || guard.state != StreamState::Open {
                return;
            }

            let core = &mut *guard;
            match core.protocol.on_stream_read(&message, core.backoff.as_mut()) {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!(stream = P::DEBUG_NAME, error = %e, "Closing stream after bad response");
                    // The peer is misbehaving; end the call without a
                    // protocol goodbye.
                    if let Some(mut call) = core.call.take() {
                        call.finish();
                    }
                    self.close(core, Status::from(e))
                }
            }
        };
        self.dispatch(event);
    }

    fn on_call_write(&self, generation: u64) {
        let mut core = self.core.lock();
        if core.generation == generation {
            core.write_in_flight = false;
        }
    }

    fn on_call_finish(&self, generation: u64, status: Status) {
        let mut core = self.core.lock();
        if core.generation != generation
            || !matches!(core.state, StreamState::Starting | StreamState::Open)
        {
            return;
        }

        // The call has already ended; there is nothing to release.
        core.call = None;
        let event = self.close(&mut core, status);
        drop(core);
        self.dispatch(event);
    }

    /// Moves to `Error` and reports `status` to the protocol. The caller
    /// releases the lock before dispatching the returned event.
    fn close(&self, core: &mut StreamCore<P>, status: Status) -> Option<P::Event> {
        if let Some(restart) = core.pending_restart.take() {
            restart.cancel();
        }
        if core.state == StreamState::Open {
            telemetry::decrement_streams_open();
        }

        match status.code() {
            Code::ResourceExhausted => {
                tracing::debug!(stream = P::DEBUG_NAME, "Server overloaded; backing off to max");
                core.backoff.reset_to_max();
            }
            Code::Unauthenticated => self.datastore.invalidate_token(),
            _ => {}
        }

        tracing::debug!(
            stream = P::DEBUG_NAME,
            code = ?status.code(),
            message = status.message(),
            "Stream closed"
        );
        core.call = None;
        core.state = StreamState::Error;
        core.generation += 1;
        core.write_in_flight = false;
        core.protocol.on_stream_finish(&status)
    }
}

/// Routes the events of one call generation back into its stream.
struct CallObserver<P: StreamProtocol> {
    stream: Weak<StreamInner<P>>,
    generation: u64,
}

impl<P: StreamProtocol> GrpcStreamObserver for CallObserver<P> {
    fn on_stream_start(&self) {
        if let Some(stream) = self.stream.upgrade() {
            stream.on_call_start(self.generation);
        }
    }

    fn on_stream_read(&self, message: Bytes) {
        if let Some(stream) = self.stream.upgrade() {
            stream.on_call_read(self.generation, message);
        }
    }

    fn on_stream_write(&self) {
        if let Some(stream) = self.stream.upgrade() {
            stream.on_call_write(self.generation);
        }
    }

    fn on_stream_finish(&self, status: Status) {
        if let Some(stream) = self.stream.upgrade() {
            stream.on_call_finish(self.generation, status);
        }
    }
}
