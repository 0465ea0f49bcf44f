//! `tonic` implementations of the call traits.
//!
//! Each call runs as one task on the runtime. The task registers with the
//! completion queue before it starts, posts every event it produces, and ends
//! the registration when it exits, so a drained queue means no call task is
//! left that could still post.

use super::{
    call::{
        GrpcStream, GrpcStreamObserver, GrpcStreamingReader, GrpcUnaryCall, Metadata,
        StreamingReaderCallback, UnaryCallback,
    },
    codec::RawCodec,
    completion_queue::{CompletionQueue, PendingOp},
    connection::metadata_to_map,
};
use crate::telemetry;
use bytes::Bytes;
use parking_lot::Mutex;
use portable_atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::{runtime::Handle, sync::mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{
    Code, Request, Status,
    client::Grpc,
    codegen::http::uri::PathAndQuery,
    metadata::MetadataMap,
    transport::Channel,
};

/// Writes buffered between the stream handle and the request body.
const OUTBOUND_BUFFER: usize = 16;

/// Everything a call task needs, captured when the call is created.
#[derive(Clone)]
pub(crate) struct CallContext {
    pub(crate) rpc_name: &'static str,
    pub(crate) path: PathAndQuery,
    pub(crate) channel: Channel,
    pub(crate) metadata: MetadataMap,
    pub(crate) runtime: Handle,
    pub(crate) completion_queue: Arc<CompletionQueue>,
    pub(crate) cancel: CancellationToken,
}

impl CallContext {
    fn request<T>(&self, message: T) -> Request<T> {
        let mut request = Request::new(message);
        *request.metadata_mut() = self.metadata.clone();
        request
    }

    async fn ready_client(&self) -> Result<Grpc<Channel>, Status> {
        let mut grpc = Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| Status::unavailable(format!("channel not ready: {e}")))?;
        Ok(grpc)
    }
}

fn record_outcome<T>(rpc_name: &'static str, result: &Result<T, Status>) {
    if let Err(status) = result {
        telemetry::increment_rpc_errors(rpc_name);
        tracing::debug!(rpc = rpc_name, code = ?status.code(), message = status.message(), "Call failed");
    }
}

pub struct TonicUnaryCall {
    context: CallContext,
    headers: Arc<Mutex<Metadata>>,
    abandoned: Arc<AtomicBool>,
}

impl TonicUnaryCall {
    pub(crate) fn new(context: CallContext) -> Self {
        Self {
            context,
            headers: Arc::default(),
            abandoned: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl GrpcUnaryCall for TonicUnaryCall {
    fn start(&mut self, request: Bytes, callback: UnaryCallback) {
        let Some(op) = self.context.completion_queue.begin() else {
            tracing::warn!(rpc = self.context.rpc_name, "Completion queue shut down; call not started");
            return;
        };

        telemetry::increment_rpcs_started(self.context.rpc_name);
        let context = self.context.clone();
        let headers = Arc::clone(&self.headers);
        let abandoned = Arc::clone(&self.abandoned);

        self.context.runtime.spawn(async move {
            let result = tokio::select! {
                () = context.cancel.cancelled() => Err(Status::cancelled("call cancelled")),
                result = unary(&context, request) => result,
            };

            let result = match result {
                Ok((metadata, body)) => {
                    *headers.lock() = metadata_to_map(&metadata);
                    Ok(body)
                }
                Err(status) => {
                    *headers.lock() = metadata_to_map(status.metadata());
                    Err(status)
                }
            };
            record_outcome(context.rpc_name, &result);

            op.post(move || {
                if !abandoned.load(Ordering::Acquire) {
                    callback(result);
                }
            });
        });
    }

    fn finish_immediately(&mut self) {
        self.abandoned.store(true, Ordering::Release);
        self.context.cancel.cancel();
    }

    fn response_headers(&self) -> Metadata {
        self.headers.lock().clone()
    }
}

async fn unary(context: &CallContext, request: Bytes) -> Result<(MetadataMap, Bytes), Status> {
    let mut grpc = context.ready_client().await?;
    let response = grpc
        .unary(context.request(request), context.path.clone(), RawCodec)
        .await?;
    let (metadata, body, _) = response.into_parts();
    Ok((metadata, body))
}

pub struct TonicStreamingReader {
    context: CallContext,
    headers: Arc<Mutex<Metadata>>,
    abandoned: Arc<AtomicBool>,
}

impl TonicStreamingReader {
    pub(crate) fn new(context: CallContext) -> Self {
        Self {
            context,
            headers: Arc::default(),
            abandoned: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl GrpcStreamingReader for TonicStreamingReader {
    fn start(&mut self, request: Bytes, callback: StreamingReaderCallback) {
        let Some(op) = self.context.completion_queue.begin() else {
            tracing::warn!(rpc = self.context.rpc_name, "Completion queue shut down; call not started");
            return;
        };

        telemetry::increment_rpcs_started(self.context.rpc_name);
        let context = self.context.clone();
        let headers = Arc::clone(&self.headers);
        let abandoned = Arc::clone(&self.abandoned);

        self.context.runtime.spawn(async move {
            let result = tokio::select! {
                () = context.cancel.cancelled() => Err(Status::cancelled("call cancelled")),
                result = read_all(&context, &headers, request) => result,
            };
            record_outcome(context.rpc_name, &result);

            op.post(move || {
                if !abandoned.load(Ordering::Acquire) {
                    callback(result);
                }
            });
        });
    }

    fn finish_immediately(&mut self) {
        self.abandoned.store(true, Ordering::Release);
        self.context.cancel.cancel();
    }

    fn response_headers(&self) -> Metadata {
        self.headers.lock().clone()
    }
}

async fn read_all(
    context: &CallContext,
    headers: &Mutex<Metadata>,
    request: Bytes,
) -> Result<Vec<Bytes>, Status> {
    let mut grpc = context.ready_client().await?;
    let response = match grpc
        .server_streaming(context.request(request), context.path.clone(), RawCodec)
        .await
    {
        Ok(response) => response,
        Err(status) => {
            *headers.lock() = metadata_to_map(status.metadata());
            return Err(status);
        }
    };
    *headers.lock() = metadata_to_map(response.metadata());

    let mut inbound = response.into_inner();
    let mut messages = Vec::new();
    while let Some(message) = inbound.message().await? {
        messages.push(message);
    }
    Ok(messages)
}

enum Command {
    Write(Bytes),
    WriteAndFinish(Bytes),
}

enum StreamEvent {
    Start,
    Read(Bytes),
    Write,
    Finish(Status),
}

/// Posts stream events, dropping them once the owner has finished the call.
struct EventSink {
    op: PendingOp,
    observer: Arc<dyn GrpcStreamObserver>,
    finished: Arc<AtomicBool>,
}

impl EventSink {
    fn post(&self, event: StreamEvent) {
        let observer = Arc::clone(&self.observer);
        let finished = Arc::clone(&self.finished);
        self.op.post(move || {
            if finished.load(Ordering::Acquire) {
                return;
            }
            match event {
                StreamEvent::Start => observer.on_stream_start(),
                StreamEvent::Read(message) => observer.on_stream_read(message),
                StreamEvent::Write => observer.on_stream_write(),
                StreamEvent::Finish(status) => observer.on_stream_finish(status),
            }
        });
    }
}

/// A bidirectional stream driven by one runtime task.
///
/// Writes travel to the task over a channel and are acknowledged once they
/// reach the request body. The task reports the stream as started once the
/// channel is ready, without waiting for the server's response headers.
pub struct TonicStream {
    context: CallContext,
    observer: Arc<dyn GrpcStreamObserver>,
    finished: Arc<AtomicBool>,
    headers: Arc<Mutex<Metadata>>,
    commands: mpsc::UnboundedSender<Command>,
    pending_commands: Option<mpsc::UnboundedReceiver<Command>>,
    half_closed: bool,
}

impl TonicStream {
    pub(crate) fn new(context: CallContext, observer: Arc<dyn GrpcStreamObserver>) -> Self {
        let (commands, pending_commands) = mpsc::unbounded_channel();
        Self {
            context,
            observer,
            finished: Arc::new(AtomicBool::new(false)),
            headers: Arc::default(),
            commands,
            pending_commands: Some(pending_commands),
            half_closed: false,
        }
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::debug!(rpc = self.context.rpc_name, "Write after the stream task exited");
        }
    }
}

impl GrpcStream for TonicStream {
    fn start(&mut self) {
        let Some(commands) = self.pending_commands.take() else {
            tracing::warn!(rpc = self.context.rpc_name, "Stream started twice");
            return;
        };
        let Some(op) = self.context.completion_queue.begin() else {
            tracing::warn!(rpc = self.context.rpc_name, "Completion queue shut down; stream not started");
            return;
        };

        telemetry::increment_rpcs_started(self.context.rpc_name);
        let sink = EventSink {
            op,
            observer: Arc::clone(&self.observer),
            finished: Arc::clone(&self.finished),
        };
        let context = self.context.clone();
        let headers = Arc::clone(&self.headers);
        self.context
            .runtime
            .spawn(drive_stream(context, sink, headers, commands));
    }

    fn write(&mut self, message: Bytes) {
        self.send(Command::Write(message));
    }

    fn write_and_finish(&mut self, message: Bytes) {
        self.finished.store(true, Ordering::Release);
        self.half_closed = true;
        self.send(Command::WriteAndFinish(message));
    }

    fn finish(&mut self) {
        self.finished.store(true, Ordering::Release);
        self.context.cancel.cancel();
    }

    fn response_headers(&self) -> Metadata {
        self.headers.lock().clone()
    }
}

impl Drop for TonicStream {
    fn drop(&mut self) {
        self.finished.store(true, Ordering::Release);
        // A half-closed stream is left to finish delivering its last write.
        if !self.half_closed {
            self.context.cancel.cancel();
        }
    }
}

async fn drive_stream(
    context: CallContext,
    sink: EventSink,
    headers: Arc<Mutex<Metadata>>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let status = tokio::select! {
        () = context.cancel.cancelled() => Status::cancelled("stream cancelled"),
        status = run_stream(&context, &sink, &headers, &mut commands) => status,
    };

    if status.code() != Code::Ok {
        telemetry::increment_rpc_errors(context.rpc_name);
    }
    tracing::debug!(rpc = context.rpc_name, code = ?status.code(), "Stream finished");
    sink.post(StreamEvent::Finish(status));
}

async fn run_stream(
    context: &CallContext,
    sink: &EventSink,
    headers: &Mutex<Metadata>,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> Status {
    let mut grpc = match context.ready_client().await {
        Ok(grpc) => grpc,
        Err(status) => return status,
    };
    sink.post(StreamEvent::Start);

    let (body_tx, body_rx) = mpsc::channel::<Bytes>(OUTBOUND_BUFFER);
    let mut body_tx = Some(body_tx);
    let call = grpc.streaming(
        context.request(ReceiverStream::new(body_rx)),
        context.path.clone(),
        RawCodec,
    );
    tokio::pin!(call);

    // Writes are serviced while waiting for the response headers, since the
    // server may hold them back until it has seen the first request.
    let mut inbound = loop {
        tokio::select! {
            response = &mut call => match response {
                Ok(response) => {
                    *headers.lock() = metadata_to_map(response.metadata());
                    break response.into_inner();
                }
                Err(status) => {
                    *headers.lock() = metadata_to_map(status.metadata());
                    return status;
                }
            },
            Some(command) = commands.recv() => forward(command, &mut body_tx, sink).await,
        }
    };

    loop {
        tokio::select! {
            message = inbound.message() => match message {
                Ok(Some(message)) => sink.post(StreamEvent::Read(message)),
                Ok(None) => return Status::new(Code::Ok, ""),
                Err(status) => return status,
            },
            Some(command) = commands.recv() => forward(command, &mut body_tx, sink).await,
        }
    }
}

async fn forward(command: Command, body_tx: &mut Option<mpsc::Sender<Bytes>>, sink: &EventSink) {
    let (message, half_close) = match command {
        Command::Write(message) => (message, false),
        Command::WriteAndFinish(message) => (message, true),
    };

    if let Some(tx) = body_tx.as_ref() {
        if tx.send(message).await.is_ok() {
            sink.post(StreamEvent::Write);
        }
    }

    if half_close {
        // Dropping the sender ends the request body.
        *body_tx = None;
    }
}
