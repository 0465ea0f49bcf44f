//! Scripted transport for tests.
//!
//! [`MockConnection`] hands out calls that do nothing on their own. Tests
//! complete them explicitly, and every completion travels through the real
//! completion queue, poller and worker queue.

use super::{
    backoff::BackoffPolicy,
    call::{
        GrpcStream, GrpcStreamObserver, GrpcStreamingReader, GrpcUnaryCall, Metadata,
        StreamingReaderCallback, UnaryCallback,
    },
    completion_queue::{CompletionQueue, PendingOp},
    connection::Connection,
    datastore::Datastore,
    serializer::RemoteSerializer,
    write_stream::{WriteStreamDelegate, WriteStreamEvent},
};
use crate::{
    auth::{CredentialsProvider, Token},
    util::AsyncQueue,
};
use bytes::Bytes;
use core::time::Duration;
use firestore_remote_core::{
    DatabaseId, Result,
    model::{MutationResult, SnapshotVersion},
    proto,
};
use futures::{FutureExt, future::BoxFuture};
use parking_lot::Mutex;
use portable_atomic::{AtomicBool, AtomicUsize, Ordering};
use prost::Message;
use std::sync::{Arc, OnceLock};
use tokio::{runtime::Handle, sync::oneshot};
use tonic::Status;

type Callback<T> = Box<dyn FnOnce(core::result::Result<T, Status>) + Send + 'static>;

/// One scripted unary or server-streaming call.
pub(crate) struct MockCall<T> {
    pub(crate) rpc_name: &'static str,
    pub(crate) token: Token,
    completion_queue: Arc<CompletionQueue>,
    request: Mutex<Option<Bytes>>,
    pending: Mutex<Option<(PendingOp, Callback<T>)>>,
    headers: Mutex<Metadata>,
}

impl<T: Send + 'static> MockCall<T> {
    fn new(rpc_name: &'static str, token: &Token, completion_queue: Arc<CompletionQueue>) -> Self {
        Self {
            rpc_name,
            token: token.clone(),
            completion_queue,
            request: Mutex::new(None),
            pending: Mutex::new(None),
            headers: Mutex::new(Metadata::new()),
        }
    }

    pub(crate) fn request(&self) -> Option<Bytes> {
        self.request.lock().clone()
    }

    /// Posts the call's result. Returns `false` if the call is not running.
    pub(crate) fn complete(&self, result: core::result::Result<T, Status>) -> bool {
        match self.pending.lock().take() {
            Some((op, callback)) => {
                op.post(move || callback(result));
                true
            }
            None => false,
        }
    }

    fn start(&self, request: Bytes, callback: Callback<T>) {
        *self.request.lock() = Some(request);
        if let Some(op) = self.completion_queue.begin() {
            *self.pending.lock() = Some((op, callback));
        }
    }

    fn abandon(&self) {
        self.pending.lock().take();
    }
}

struct MockCallHandle<T>(Arc<MockCall<T>>);

impl GrpcUnaryCall for MockCallHandle<Bytes> {
    fn start(&mut self, request: Bytes, callback: UnaryCallback) {
        self.0.start(request, callback);
    }

    fn finish_immediately(&mut self) {
        self.0.abandon();
    }

    fn response_headers(&self) -> Metadata {
        self.0.headers.lock().clone()
    }
}

impl GrpcStreamingReader for MockCallHandle<Vec<Bytes>> {
    fn start(&mut self, request: Bytes, callback: StreamingReaderCallback) {
        self.0.start(request, callback);
    }

    fn finish_immediately(&mut self) {
        self.0.abandon();
    }

    fn response_headers(&self) -> Metadata {
        self.0.headers.lock().clone()
    }
}

/// One scripted bidirectional stream. Writes are acknowledged immediately
/// unless [`MockStream::hold_write_acks`] was called.
pub(crate) struct MockStream {
    pub(crate) rpc_name: &'static str,
    pub(crate) token: Token,
    observer: Arc<dyn GrpcStreamObserver>,
    completion_queue: Arc<CompletionQueue>,
    op: Mutex<Option<PendingOp>>,
    writes: Mutex<Vec<Bytes>>,
    finished: AtomicBool,
    half_closed: AtomicBool,
    hold_acks: AtomicBool,
    held_acks: AtomicUsize,
}

impl MockStream {
    pub(crate) fn open(&self) {
        self.post(|observer| observer.on_stream_start());
    }

    pub(crate) fn respond(&self, message: Bytes) {
        self.post(move |observer| observer.on_stream_read(message));
    }

    /// Ends the call from the server side.
    pub(crate) fn fail(&self, status: Status) {
        self.post(move |observer| observer.on_stream_finish(status));
        self.op.lock().take();
    }

    /// Keeps later writes unacknowledged until [`Self::release_write_ack`].
    pub(crate) fn hold_write_acks(&self) {
        self.hold_acks.store(true, Ordering::SeqCst);
    }

    /// Acknowledges the oldest held write. Returns `false` if none is held.
    pub(crate) fn release_write_ack(&self) -> bool {
        let released = self
            .held_acks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |held| held.checked_sub(1))
            .is_ok();
        if released {
            self.post(|observer| observer.on_stream_write());
        }
        released
    }

    pub(crate) fn writes(&self) -> Vec<Bytes> {
        self.writes.lock().clone()
    }

    /// Finished by the client, with or without a final write.
    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub(crate) fn is_half_closed(&self) -> bool {
        self.half_closed.load(Ordering::SeqCst)
    }

    fn post<F>(&self, event: F)
    where
        F: FnOnce(&dyn GrpcStreamObserver) + Send + 'static,
    {
        if let Some(op) = self.op.lock().as_ref() {
            let observer = Arc::clone(&self.observer);
            op.post(move || event(observer.as_ref()));
        }
    }
}

struct MockStreamHandle(Arc<MockStream>);

impl GrpcStream for MockStreamHandle {
    fn start(&mut self) {
        *self.0.op.lock() = self.0.completion_queue.begin();
    }

    fn write(&mut self, message: Bytes) {
        self.0.writes.lock().push(message);
        if self.0.hold_acks.load(Ordering::SeqCst) {
            self.0.held_acks.fetch_add(1, Ordering::SeqCst);
        } else {
            self.0.post(|observer| observer.on_stream_write());
        }
    }

    fn write_and_finish(&mut self, message: Bytes) {
        self.0.writes.lock().push(message);
        self.0.half_closed.store(true, Ordering::SeqCst);
        self.finish();
    }

    fn finish(&mut self) {
        self.0.finished.store(true, Ordering::SeqCst);
        self.0.op.lock().take();
    }

    fn response_headers(&self) -> Metadata {
        Metadata::new()
    }
}

#[derive(Default)]
struct MockCalls {
    created: Vec<&'static str>,
    unary: Vec<Arc<MockCall<Bytes>>>,
    readers: Vec<Arc<MockCall<Vec<Bytes>>>>,
    streams: Vec<Arc<MockStream>>,
}

#[derive(Default)]
struct MockState {
    completion_queue: OnceLock<Arc<CompletionQueue>>,
    calls: Mutex<MockCalls>,
    shut_down: AtomicBool,
}

#[derive(Clone, Default)]
pub(crate) struct MockConnection {
    state: Arc<MockState>,
}

impl MockConnection {
    fn attach(&self, completion_queue: Arc<CompletionQueue>) {
        let _ = self.state.completion_queue.set(completion_queue);
    }

    fn completion_queue(&self) -> Arc<CompletionQueue> {
        Arc::clone(
            self.state
                .completion_queue
                .get()
                .expect("mock connection used before it was attached"),
        )
    }

    /// RPC names of every call created so far, in creation order.
    pub(crate) fn created(&self) -> Vec<&'static str> {
        self.state.calls.lock().created.clone()
    }

    pub(crate) fn unary_calls(&self) -> Vec<Arc<MockCall<Bytes>>> {
        self.state.calls.lock().unary.clone()
    }

    pub(crate) fn readers(&self) -> Vec<Arc<MockCall<Vec<Bytes>>>> {
        self.state.calls.lock().readers.clone()
    }

    pub(crate) fn streams(&self) -> Vec<Arc<MockStream>> {
        self.state.calls.lock().streams.clone()
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.state.shut_down.load(Ordering::SeqCst)
    }
}

impl Connection for MockConnection {
    fn create_stream(
        &self,
        rpc_name: &'static str,
        token: &Token,
        observer: Arc<dyn GrpcStreamObserver>,
    ) -> Box<dyn GrpcStream> {
        let stream = Arc::new(MockStream {
            rpc_name,
            token: token.clone(),
            observer,
            completion_queue: self.completion_queue(),
            op: Mutex::new(None),
            writes: Mutex::new(Vec::new()),
            finished: AtomicBool::new(false),
            half_closed: AtomicBool::new(false),
            hold_acks: AtomicBool::new(false),
            held_acks: AtomicUsize::new(0),
        });
        let mut calls = self.state.calls.lock();
        calls.created.push(rpc_name);
        calls.streams.push(Arc::clone(&stream));
        Box::new(MockStreamHandle(stream))
    }

    fn create_unary_call(&self, rpc_name: &'static str, token: &Token) -> Box<dyn GrpcUnaryCall> {
        let call = Arc::new(MockCall::new(rpc_name, token, self.completion_queue()));
        let mut calls = self.state.calls.lock();
        calls.created.push(rpc_name);
        calls.unary.push(Arc::clone(&call));
        Box::new(MockCallHandle(call))
    }

    fn create_streaming_reader(
        &self,
        rpc_name: &'static str,
        token: &Token,
    ) -> Box<dyn GrpcStreamingReader> {
        let call = Arc::new(MockCall::new(rpc_name, token, self.completion_queue()));
        let mut calls = self.state.calls.lock();
        calls.created.push(rpc_name);
        calls.readers.push(Arc::clone(&call));
        Box::new(MockCallHandle(call))
    }

    fn shutdown(&self) {
        self.state.shut_down.store(true, Ordering::SeqCst);
        let calls = self.state.calls.lock();
        for call in &calls.unary {
            call.complete(Err(Status::cancelled("connection shut down")));
        }
        for call in &calls.readers {
            call.complete(Err(Status::cancelled("connection shut down")));
        }
        for stream in &calls.streams {
            stream.fail(Status::cancelled("connection shut down"));
        }
    }
}

/// Credentials whose outcome the test controls.
pub(crate) struct FakeCredentials {
    result: Mutex<Result<Token>>,
    requests: AtomicUsize,
    invalidations: AtomicUsize,
}

impl FakeCredentials {
    pub(crate) fn new(result: Result<Token>) -> Arc<Self> {
        Arc::new(Self {
            result: Mutex::new(result),
            requests: AtomicUsize::new(0),
            invalidations: AtomicUsize::new(0),
        })
    }

    pub(crate) fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub(crate) fn invalidations(&self) -> usize {
        self.invalidations.load(Ordering::SeqCst)
    }
}

impl CredentialsProvider for FakeCredentials {
    fn get_token(&self) -> BoxFuture<'static, Result<Token>> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        futures::future::ready(self.result.lock().clone()).boxed()
    }

    fn invalidate_token(&self) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }
}

/// Records every write-stream event in order.
#[derive(Default)]
pub(crate) struct RecordingDelegate {
    events: Mutex<Vec<WriteStreamEvent>>,
}

impl RecordingDelegate {
    pub(crate) fn events(&self) -> Vec<WriteStreamEvent> {
        self.events.lock().clone()
    }

    pub(crate) fn last(&self) -> Option<WriteStreamEvent> {
        self.events.lock().last().cloned()
    }
}

impl WriteStreamDelegate for RecordingDelegate {
    fn on_write_stream_open(&self) {
        self.events.lock().push(WriteStreamEvent::Open);
    }

    fn on_write_stream_handshake_complete(&self) {
        self.events.lock().push(WriteStreamEvent::HandshakeComplete);
    }

    fn on_write_stream_mutation_result(
        &self,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
    ) {
        self.events.lock().push(WriteStreamEvent::MutationResult {
            commit_version,
            results,
        });
    }

    fn on_write_stream_close(&self, status: Status) {
        self.events.lock().push(WriteStreamEvent::Closed(status));
    }
}

/// Backoff that records how the stream drives it and never waits.
#[derive(Clone, Default)]
pub(crate) struct RecordingBackoff {
    pub(crate) calls: Arc<Mutex<Vec<&'static str>>>,
}

impl BackoffPolicy for RecordingBackoff {
    fn next_delay(&mut self) -> Duration {
        self.calls.lock().push("next_delay");
        Duration::ZERO
    }

    fn reset(&mut self) {
        self.calls.lock().push("reset");
    }

    fn reset_to_max(&mut self) {
        self.calls.lock().push("reset_to_max");
    }
}

/// A datastore over a [`MockConnection`], with its queue and credentials.
pub(crate) struct Harness {
    pub(crate) queue: Arc<AsyncQueue>,
    pub(crate) datastore: Arc<Datastore>,
    pub(crate) mock: MockConnection,
    pub(crate) credentials: Arc<FakeCredentials>,
}

impl Harness {
    /// Must be called from within a multi-threaded Tokio runtime.
    pub(crate) fn new() -> Self {
        Self::with_credentials(FakeCredentials::new(Ok(Token::new("test-token", None))))
    }

    pub(crate) fn with_credentials(credentials: Arc<FakeCredentials>) -> Self {
        let queue = AsyncQueue::new("test-worker", Handle::current()).unwrap();
        let mock = MockConnection::default();
        let serializer = Arc::new(RemoteSerializer::new(DatabaseId::new("p", "d")));

        let connection = mock.clone();
        let datastore = Datastore::with_connection(
            Arc::clone(&queue),
            credentials.clone(),
            serializer,
            move |completion_queue| {
                connection.attach(completion_queue);
                Ok(Box::new(connection))
            },
        )
        .unwrap();

        Self {
            queue,
            datastore,
            mock,
            credentials,
        }
    }

    /// Runs `f` on the worker queue.
    pub(crate) async fn run<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.queue.run(f).await.unwrap()
    }

    /// Waits until every completion posted so far has been delivered.
    pub(crate) async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        let op = self
            .datastore
            .completion_queue()
            .begin()
            .expect("completion queue already shut down");
        op.post(move || {
            let _ = tx.send(());
        });
        drop(op);

        tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("completion queue flush timed out")
            .expect("flush marker dropped");
    }

    pub(crate) async fn shutdown(&self) {
        let datastore = Arc::clone(&self.datastore);
        self.run(move || datastore.shutdown()).await;
        self.queue.shutdown();
    }
}

/// Polls `condition` until it holds, panicking after a few seconds.
pub(crate) async fn eventually<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

/// A write-stream response carrying only a token.
pub(crate) fn handshake_response(token: &'static [u8]) -> Bytes {
    proto::WriteResponse {
        stream_token: Bytes::from_static(token),
        ..Default::default()
    }
    .encode_to_vec()
    .into()
}

/// A write acknowledgement with `results` write results committed at
/// `commit_seconds`.
pub(crate) fn ack_response(token: &'static [u8], results: usize, commit_seconds: i64) -> Bytes {
    proto::WriteResponse {
        stream_id: String::new(),
        stream_token: Bytes::from_static(token),
        write_results: vec![proto::WriteResult::default(); results],
        commit_time: Some(prost_types::Timestamp {
            seconds: commit_seconds,
            nanos: 0,
        }),
    }
    .encode_to_vec()
    .into()
}
