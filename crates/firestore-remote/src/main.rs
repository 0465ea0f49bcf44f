use anyhow::{Context, anyhow};
use clap::Parser;
use firestore_remote::{
    auth::{CredentialsProvider, EmptyCredentialsProvider, StaticCredentialsProvider, Token},
    config::{Action, CliArgs, ClientConfig},
    remote::{
        Datastore, ExponentialBackoff, RemoteSerializer, WriteStream, WriteStreamDelegate,
        WriteStreamEvent,
    },
    telemetry::{init_telemetry, shutdown_telemetry},
    util::AsyncQueue,
};
use firestore_remote_core::model::{MaybeDocument, Mutation, MutationResult, SnapshotVersion};
use std::sync::Arc;
use tokio::{
    runtime::Handle,
    signal,
    sync::{mpsc, oneshot},
};
use tonic::Status;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Connection attempts the `stream` command makes before giving up.
const MAX_STREAM_ATTEMPTS: usize = 5;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ClientConfig::try_from(args)?;

    let providers = init_telemetry()?;
    log_startup_info(&config);

    let queue = AsyncQueue::new("firestore-worker", Handle::current())?;
    let credentials: Arc<dyn CredentialsProvider> = match &config.token {
        Some(token) => Arc::new(StaticCredentialsProvider::new(Token::new(token.clone(), None))),
        None => Arc::new(EmptyCredentialsProvider),
    };
    let serializer = Arc::new(RemoteSerializer::new(
        config.database_info.database_id.clone(),
    ));
    let datastore = Datastore::new(
        config.database_info.clone(),
        Arc::clone(&queue),
        credentials,
        serializer,
    )?;

    let result = tokio::select! {
        result = execute(&datastore, config) => result,
        () = shutdown_signal() => {
            tracing::info!("Shutdown signal received, abandoning the command");
            Ok(())
        }
    };

    let worker = Arc::clone(&datastore);
    if let Err(e) = queue.run(move || worker.shutdown()).await {
        tracing::error!(error = %e, "Datastore shutdown failed");
    }
    queue.shutdown();

    if let Err(e) = &result {
        tracing::error!(error = %e, "Command failed");
    }
    shutdown_telemetry(providers);
    result
}

fn log_startup_info(config: &ClientConfig) {
    if cfg!(debug_assertions) {
        tracing::info!("Starting client with full config: {:#?}", config.database_info);
    } else {
        tracing::info!(
            host = %config.database_info.host,
            database = %config.database_info.database_id.name(),
            "Starting client"
        );
    }
}

async fn execute(datastore: &Arc<Datastore>, config: ClientConfig) -> anyhow::Result<()> {
    match config.action {
        Action::Lookup(keys) => {
            let (tx, rx) = oneshot::channel();
            datastore.lookup_documents(keys, move |result| {
                let _ = tx.send(result);
            });
            let documents = rx.await.context("lookup abandoned")??;
            for document in &documents {
                print_document(document);
            }
        }
        Action::Commit(mutations) => {
            let count = mutations.len();
            let (tx, rx) = oneshot::channel();
            datastore.commit_mutations(mutations, move |result| {
                let _ = tx.send(result);
            });
            rx.await.context("commit abandoned")??;
            println!("committed {count} mutation(s)");
        }
        Action::Stream(mutations) => {
            let (commit_version, results) =
                stream_mutations(datastore, mutations, config.backoff).await?;
            println!(
                "acknowledged {} mutation(s) at {}.{:09}",
                results.len(),
                commit_version.seconds,
                commit_version.nanos
            );
        }
    }
    Ok(())
}

fn print_document(document: &MaybeDocument) {
    let version = document.version();
    match document {
        MaybeDocument::Document { key, data, .. } => {
            println!("{key} @ {}.{:09}: {data:?}", version.seconds, version.nanos);
        }
        MaybeDocument::NoDocument { key, .. } => {
            println!("{key} @ {}.{:09}: <missing>", version.seconds, version.nanos);
        }
    }
}

/// Forwards write-stream events to the task driving the stream.
struct ChannelDelegate {
    events: mpsc::UnboundedSender<WriteStreamEvent>,
}

impl ChannelDelegate {
    fn send(&self, event: WriteStreamEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("Write stream driver gone; dropping event");
        }
    }
}

impl WriteStreamDelegate for ChannelDelegate {
    fn on_write_stream_open(&self) {
        self.send(WriteStreamEvent::Open);
    }

    fn on_write_stream_handshake_complete(&self) {
        self.send(WriteStreamEvent::HandshakeComplete);
    }

    fn on_write_stream_mutation_result(
        &self,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
    ) {
        self.send(WriteStreamEvent::MutationResult {
            commit_version,
            results,
        });
    }

    fn on_write_stream_close(&self, status: Status) {
        self.send(WriteStreamEvent::Closed(status));
    }
}

/// Writes one batch through a [`WriteStream`], reconnecting after failures,
/// and returns its acknowledgement.
async fn stream_mutations(
    datastore: &Arc<Datastore>,
    mutations: Vec<Mutation>,
    backoff: ExponentialBackoff,
) -> anyhow::Result<(SnapshotVersion, Vec<MutationResult>)> {
    let (tx, mut events) = mpsc::unbounded_channel();
    let stream = WriteStream::with_backoff(
        datastore,
        Arc::new(ChannelDelegate { events: tx }),
        Box::new(backoff),
    );
    let queue = Arc::clone(datastore.worker_queue());

    let s = stream.clone();
    queue.run(move || s.start()).await?;

    let mut attempts = 1;
    let outcome = loop {
        let Some(event) = events.recv().await else {
            break Err(anyhow!("write stream delegate dropped"));
        };

        // Checked on the queue: the stream may have closed since the event
        // was sent.
        let s = stream.clone();
        match event {
            WriteStreamEvent::Open => {
                queue
                    .run(move || {
                        if s.is_open() {
                            s.write_handshake();
                        }
                    })
                    .await?;
            }
            WriteStreamEvent::HandshakeComplete => {
                let batch = mutations.clone();
                queue
                    .run(move || {
                        if s.is_open() && s.is_handshake_complete() {
                            s.write_mutations(&batch);
                        }
                    })
                    .await?;
            }
            WriteStreamEvent::MutationResult {
                commit_version,
                results,
            } => break Ok((commit_version, results)),
            WriteStreamEvent::Closed(status) if attempts < MAX_STREAM_ATTEMPTS => {
                attempts += 1;
                tracing::warn!(
                    code = ?status.code(),
                    message = status.message(),
                    attempt = attempts,
                    "Write stream closed; reconnecting"
                );
                queue.run(move || s.start()).await?;
            }
            WriteStreamEvent::Closed(status) => {
                break Err(anyhow!(
                    "write stream closed after {attempts} attempts: {:?}: {}",
                    status.code(),
                    status.message()
                ));
            }
        }
    };

    let s = stream.clone();
    queue.run(move || s.stop()).await?;
    outcome
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }
}
