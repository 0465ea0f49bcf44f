//! Call factory and completion-queue owner.
//!
//! A [`Datastore`] owns the completion queue shared by every call it issues,
//! the poller thread that drains it, and the [`Connection`] that builds the
//! calls. It fetches a token for every call, keeps unary calls alive until
//! their completion has been delivered, and owns the orderly teardown of all
//! of the above.
//!
//! ## Threading
//!
//! The poller thread blocks on [`CompletionQueue::next`] and turns each
//! completion into exactly one worker-queue task, in order. It never touches
//! datastore or stream state itself; every continuation runs on the worker
//! queue.
//!
//! ## Shutdown
//!
//! [`Datastore::shutdown`] runs on the worker queue and proceeds in phases:
//!
//! 1. Stop delivering completions to their continuations.
//! 2. Cancel every call through the connection.
//! 3. Close the completion queue to new operations.
//! 4. Join the poller once the queue has drained.
//! 5. Fail the unary calls that never completed with [`Error::Cancelled`].
//!
//! No callback fires after `shutdown` returns.

use super::{
    call::{
        GrpcStream, GrpcStreamObserver, GrpcStreamingReader, GrpcUnaryCall, Metadata,
    },
    completion_queue::CompletionQueue,
    connection::{Connection, GrpcConnection},
    serializer::Serializer,
};
use crate::{
    auth::{CredentialsProvider, Token},
    telemetry,
    util::AsyncQueue,
};
use bytes::Bytes;
use firestore_remote_core::{
    DatabaseInfo, Error, RPC_NAME_COMMIT, RPC_NAME_LOOKUP, Result,
    model::{DocumentKey, MaybeDocument, Mutation},
};
use parking_lot::Mutex;
use portable_atomic::{AtomicBool, Ordering};
use std::{
    collections::BTreeMap,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Instant,
};
use tonic::{Code, Status};

/// Response headers worth logging.
pub const WHITELISTED_HEADERS: [&str; 5] = [
    "date",
    "x-google-backends",
    "x-google-netmon-label",
    "x-google-service",
    "x-google-gfe-request-trace",
];

pub type CommitCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;
pub type LookupCallback = Box<dyn FnOnce(Result<Vec<MaybeDocument>>) + Send + 'static>;

struct CommitEntry {
    call: Box<dyn GrpcUnaryCall>,
    completion: CommitCallback,
}

struct LookupEntry {
    call: Box<dyn GrpcStreamingReader>,
    completion: LookupCallback,
}

#[derive(Default)]
struct InFlightCalls {
    next_id: u64,
    commits: BTreeMap<u64, CommitEntry>,
    lookups: BTreeMap<u64, LookupEntry>,
}

impl InFlightCalls {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

pub struct Datastore {
    worker_queue: Arc<AsyncQueue>,
    credentials: Arc<dyn CredentialsProvider>,
    serializer: Arc<dyn Serializer>,
    completion_queue: Arc<CompletionQueue>,
    connection: Box<dyn Connection>,
    poller: Mutex<Option<JoinHandle<()>>>,
    /// Cleared first thing on shutdown; completions still in flight are then
    /// dropped instead of run.
    active: Arc<AtomicBool>,
    shut_down: AtomicBool,
    calls: Mutex<InFlightCalls>,
}

impl Datastore {
    /// Creates a datastore talking to `database_info` over a [`GrpcConnection`].
    ///
    /// # Errors
    ///
    /// - [`Error::Transport`] if the channel cannot be configured.
    /// - [`Error::ChannelError`] if the poller thread cannot be spawned.
    pub fn new(
        database_info: DatabaseInfo,
        worker_queue: Arc<AsyncQueue>,
        credentials: Arc<dyn CredentialsProvider>,
        serializer: Arc<dyn Serializer>,
    ) -> Result<Arc<Self>> {
        let runtime = worker_queue.runtime().clone();
        Self::with_connection(worker_queue, credentials, serializer, move |completion_queue| {
            let connection = GrpcConnection::new(database_info, completion_queue, runtime)?;
            Ok(Box::new(connection))
        })
    }

    /// Creates a datastore over the connection built by `connect`, which is
    /// handed the completion queue the connection must post to.
    ///
    /// # Errors
    ///
    /// Whatever `connect` fails with, or [`Error::ChannelError`] if the
    /// poller thread cannot be spawned.
    pub fn with_connection<F>(
        worker_queue: Arc<AsyncQueue>,
        credentials: Arc<dyn CredentialsProvider>,
        serializer: Arc<dyn Serializer>,
        connect: F,
    ) -> Result<Arc<Self>>
    where
        F: FnOnce(Arc<CompletionQueue>) -> Result<Box<dyn Connection>>,
    {
        let completion_queue = CompletionQueue::new();
        let connection = connect(Arc::clone(&completion_queue))?;
        let active = Arc::new(AtomicBool::new(true));

        let poller = {
            let completion_queue = Arc::clone(&completion_queue);
            let worker_queue = Arc::clone(&worker_queue);
            let active = Arc::clone(&active);
            thread::Builder::new()
                .name(format!("{}-cq-poller", worker_queue.name()))
                .spawn(move || poll_completion_queue(&completion_queue, &worker_queue, &active))
                .map_err(|e| Error::ChannelError {
                    context: format!("failed to spawn completion queue poller: {e}"),
                })?
        };

        Ok(Arc::new(Self {
            worker_queue,
            credentials,
            serializer,
            completion_queue,
            connection,
            poller: Mutex::new(Some(poller)),
            active,
            shut_down: AtomicBool::new(false),
            calls: Mutex::new(InFlightCalls::default()),
        }))
    }

    pub fn worker_queue(&self) -> &Arc<AsyncQueue> {
        &self.worker_queue
    }

    pub fn serializer(&self) -> &Arc<dyn Serializer> {
        &self.serializer
    }

    pub fn completion_queue(&self) -> &Arc<CompletionQueue> {
        &self.completion_queue
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Number of unary calls whose completion has not been delivered yet.
    pub fn in_flight_calls(&self) -> usize {
        let calls = self.calls.lock();
        calls.commits.len() + calls.lookups.len()
    }

    /// Builds a bidirectional stream bound to the shared completion queue.
    /// The observer's events arrive on the worker queue.
    ///
    /// Must be called on the worker queue.
    pub fn create_stream(
        &self,
        rpc_name: &'static str,
        token: &Token,
        observer: Arc<dyn GrpcStreamObserver>,
    ) -> Box<dyn GrpcStream> {
        self.worker_queue.verify_is_current_queue();
        tracing::debug!(rpc = rpc_name, "Creating stream");
        self.connection.create_stream(rpc_name, token, observer)
    }

    /// Fetches the current token and hands the outcome to `callback` on the
    /// worker queue, whichever thread the provider resolves on.
    pub fn with_token<F>(&self, callback: F)
    where
        F: FnOnce(Result<Token>) + Send + 'static,
    {
        let token = self.credentials.get_token();
        let worker_queue = Arc::clone(&self.worker_queue);

        self.worker_queue.runtime().spawn(async move {
            let result = token.await;
            if !worker_queue.enqueue(move || callback(result)) {
                tracing::debug!("Worker queue shut down; dropping token callback");
            }
        });
    }

    pub fn invalidate_token(&self) {
        self.credentials.invalidate_token();
    }

    /// Commits `mutations` in one unary call. `completion` runs exactly once,
    /// on the worker queue.
    pub fn commit_mutations<F>(self: &Arc<Self>, mutations: Vec<Mutation>, completion: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let started = Instant::now();
        let this = Arc::clone(self);
        self.with_token(move |token| {
            let token = match this.checked_token(token) {
                Ok(token) => token,
                Err(e) => {
                    tracing::debug!(rpc = RPC_NAME_COMMIT, error = %e, "Commit not issued");
                    completion(Err(e));
                    return;
                }
            };

            let request = this.serializer.encode_commit(&mutations);
            let mut call = this.connection.create_unary_call(RPC_NAME_COMMIT, &token);
            let id = this.calls.lock().next_id();

            let datastore = Arc::downgrade(&this);
            call.start(
                request,
                Box::new(move |result: core::result::Result<Bytes, Status>| {
                    if let Some(datastore) = datastore.upgrade() {
                        datastore.on_commit_finished(id, result, started);
                    }
                }),
            );

            tracing::debug!(rpc = RPC_NAME_COMMIT, id, mutations = mutations.len(), "Commit issued");
            this.calls.lock().commits.insert(
                id,
                CommitEntry {
                    call,
                    completion: Box::new(completion),
                },
            );
        });
    }

    /// Looks up `keys` in one server-streaming call. `completion` runs
    /// exactly once, on the worker queue, with the documents sorted by key.
    pub fn lookup_documents<F>(self: &Arc<Self>, keys: Vec<DocumentKey>, completion: F)
    where
        F: FnOnce(Result<Vec<MaybeDocument>>) + Send + 'static,
    {
        let started = Instant::now();
        let this = Arc::clone(self);
        self.with_token(move |token| {
            let token = match this.checked_token(token) {
                Ok(token) => token,
                Err(e) => {
                    tracing::debug!(rpc = RPC_NAME_LOOKUP, error = %e, "Lookup not issued");
                    completion(Err(e));
                    return;
                }
            };

            let request = this.serializer.encode_lookup(&keys);
            let mut call = this.connection.create_streaming_reader(RPC_NAME_LOOKUP, &token);
            let id = this.calls.lock().next_id();

            let datastore = Arc::downgrade(&this);
            call.start(
                request,
                Box::new(move |result: core::result::Result<Vec<Bytes>, Status>| {
                    if let Some(datastore) = datastore.upgrade() {
                        datastore.on_lookup_finished(id, result, started);
                    }
                }),
            );

            tracing::debug!(rpc = RPC_NAME_LOOKUP, id, keys = keys.len(), "Lookup issued");
            this.calls.lock().lookups.insert(
                id,
                LookupEntry {
                    call,
                    completion: Box::new(completion),
                },
            );
        });
    }

    fn checked_token(&self, token: Result<Token>) -> Result<Token> {
        if self.is_shut_down() {
            return Err(Error::ServiceShutdown);
        }
        token
    }

    fn on_commit_finished(&self, id: u64, result: core::result::Result<Bytes, Status>, started: Instant) {
        let Some(entry) = self.calls.lock().commits.remove(&id) else {
            tracing::warn!(rpc = RPC_NAME_COMMIT, id, "Completion for unknown commit");
            return;
        };
        telemetry::record_rpc_duration(RPC_NAME_COMMIT, started.elapsed().as_secs_f64() * 1000.0);
        self.log_headers(&entry.call.response_headers());

        let result = result.map(|_| ()).map_err(|status| self.translate_status(status));
        tracing::debug!(rpc = RPC_NAME_COMMIT, id, ok = result.is_ok(), "Commit finished");
        (entry.completion)(result);
    }

    fn on_lookup_finished(
        &self,
        id: u64,
        result: core::result::Result<Vec<Bytes>, Status>,
        started: Instant,
    ) {
        let Some(entry) = self.calls.lock().lookups.remove(&id) else {
            tracing::warn!(rpc = RPC_NAME_LOOKUP, id, "Completion for unknown lookup");
            return;
        };
        telemetry::record_rpc_duration(RPC_NAME_LOOKUP, started.elapsed().as_secs_f64() * 1000.0);
        self.log_headers(&entry.call.response_headers());

        let result = result
            .map_err(|status| self.translate_status(status))
            .and_then(|messages| self.decode_lookup(&messages));
        tracing::debug!(rpc = RPC_NAME_LOOKUP, id, ok = result.is_ok(), "Lookup finished");
        (entry.completion)(result);
    }

    fn decode_lookup(&self, messages: &[Bytes]) -> Result<Vec<MaybeDocument>> {
        let mut documents = messages
            .iter()
            .map(|message| self.serializer.decode_lookup_response(message))
            .collect::<Result<Vec<_>>>()?;
        documents.sort_by(|a, b| a.key().cmp(b.key()));
        Ok(documents)
    }

    fn translate_status(&self, status: Status) -> Error {
        if status.code() == Code::Unauthenticated {
            self.invalidate_token();
        }
        Error::from(status)
    }

    /// Logs the diagnostic headers of a response at `debug`.
    pub fn log_headers(&self, headers: &Metadata) {
        let rendered = Self::whitelisted_headers_as_string(headers);
        if !rendered.is_empty() {
            tracing::debug!(headers = %rendered.trim_end(), "Response headers");
        }
    }

    /// Keeps only the headers in [`WHITELISTED_HEADERS`].
    pub fn extract_whitelisted_headers(headers: &Metadata) -> Metadata {
        headers
            .iter()
            .filter(|(name, _)| {
                WHITELISTED_HEADERS
                    .iter()
                    .any(|allowed| name.eq_ignore_ascii_case(allowed))
            })
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    /// Renders the whitelisted headers as `name: value` lines, in name order.
    pub fn whitelisted_headers_as_string(headers: &Metadata) -> String {
        Self::extract_whitelisted_headers(headers)
            .iter()
            .map(|(name, value)| format!("{name}: {value}\n"))
            .collect()
    }

    /// Tears down every call and the poller. See the module docs for the
    /// phases. A second call does nothing.
    ///
    /// Must be called on the worker queue.
    pub fn shutdown(&self) {
        self.worker_queue.verify_is_current_queue();
        if self.shut_down.swap(true, Ordering::AcqRel) {
            tracing::debug!("Datastore already shut down");
            return;
        }

        // === Phase 1: Stop delivering completions ===
        tracing::info!("Shutting down datastore");
        self.active.store(false, Ordering::Release);

        // === Phase 2: Cancel all calls ===
        self.connection.shutdown();

        // === Phase 3: Refuse new operations ===
        self.completion_queue.shutdown();

        // === Phase 4: Wait for the poller to drain the queue ===
        tracing::debug!(
            pending = self.completion_queue.pending_operations(),
            "Draining completion queue"
        );
        if let Some(poller) = self.poller.lock().take() {
            if poller.join().is_err() {
                tracing::error!("Completion queue poller panicked");
            }
        }

        // === Phase 5: Fail whatever never completed ===
        let (commits, lookups) = {
            let mut calls = self.calls.lock();
            (
                core::mem::take(&mut calls.commits),
                core::mem::take(&mut calls.lookups),
            )
        };
        if !commits.is_empty() || !lookups.is_empty() {
            tracing::debug!(
                commits = commits.len(),
                lookups = lookups.len(),
                "Cancelling unfinished calls"
            );
        }
        for (_, mut entry) in commits {
            entry.call.finish_immediately();
            (entry.completion)(Err(Error::Cancelled));
        }
        for (_, mut entry) in lookups {
            entry.call.finish_immediately();
            (entry.completion)(Err(Error::Cancelled));
        }

        tracing::info!("Datastore shutdown complete");
    }
}

/// Forwards every completion to the worker queue, one task each, until the
/// queue has been shut down and drained.
fn poll_completion_queue(
    completion_queue: &CompletionQueue,
    worker_queue: &AsyncQueue,
    active: &Arc<AtomicBool>,
) {
    tracing::trace!("Completion queue poller started");

    while let Some(completion) = completion_queue.next() {
        let active = Arc::clone(active);
        let accepted = worker_queue.enqueue(move || {
            if active.load(Ordering::Acquire) {
                completion.complete();
            }
        });
        if !accepted {
            tracing::trace!("Worker queue shut down; dropping completion");
        }
    }

    tracing::trace!("Completion queue poller stopped");
}
