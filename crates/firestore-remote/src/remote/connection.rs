//! Channel ownership and call construction.
//!
//! A [`Connection`] is bound to one database and one completion queue. It
//! hands out call objects for a given RPC name and token; the calls post
//! their completions to that queue. [`GrpcConnection`] is the `tonic`
//! implementation used in production.

use super::{
    call::{GrpcStream, GrpcStreamObserver, GrpcStreamingReader, GrpcUnaryCall, Metadata},
    completion_queue::CompletionQueue,
    tonic_call::{CallContext, TonicStream, TonicStreamingReader, TonicUnaryCall},
};
use crate::auth::Token;
use firestore_remote_core::{DatabaseInfo, Error, Result};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tonic::{
    codegen::http::uri::PathAndQuery,
    metadata::{AsciiMetadataValue, MetadataMap},
    transport::{Channel, ClientTlsConfig, Endpoint},
};

/// Value of the `x-goog-api-client` request header.
pub const API_CLIENT_HEADER: &str = concat!("gl-rust/ fire/", env!("CARGO_PKG_VERSION"), " grpc/");

/// Factory for the calls a datastore issues.
pub trait Connection: Send + Sync + 'static {
    fn create_stream(
        &self,
        rpc_name: &'static str,
        token: &Token,
        observer: Arc<dyn GrpcStreamObserver>,
    ) -> Box<dyn GrpcStream>;

    fn create_unary_call(&self, rpc_name: &'static str, token: &Token) -> Box<dyn GrpcUnaryCall>;

    fn create_streaming_reader(
        &self,
        rpc_name: &'static str,
        token: &Token,
    ) -> Box<dyn GrpcStreamingReader>;

    /// Cancels every call created so far. Each surfaces a cancelled
    /// completion on the queue.
    fn shutdown(&self);
}

/// [`Connection`] over a lazily connected `tonic` channel.
pub struct GrpcConnection {
    database_info: DatabaseInfo,
    channel: Channel,
    runtime: Handle,
    completion_queue: Arc<CompletionQueue>,
    shutdown: CancellationToken,
}

impl GrpcConnection {
    /// Builds the channel. No network I/O happens until the first call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the host is not a valid URI or the TLS
    /// configuration is rejected.
    pub fn new(
        database_info: DatabaseInfo,
        completion_queue: Arc<CompletionQueue>,
        runtime: Handle,
    ) -> Result<Self> {
        let scheme = if database_info.ssl_enabled {
            "https"
        } else {
            "http"
        };
        let mut endpoint = Endpoint::from_shared(format!("{scheme}://{}", database_info.host))
            .map_err(|e| Error::Transport {
                context: format!("invalid host '{}': {e}", database_info.host),
            })?;

        if database_info.ssl_enabled {
            endpoint = endpoint
                .tls_config(ClientTlsConfig::new().with_native_roots())
                .map_err(|e| Error::Transport {
                    context: format!("invalid TLS configuration: {e}"),
                })?;
        }

        // The lazy channel spawns its worker on whichever runtime is current.
        let channel = {
            let _guard = runtime.enter();
            endpoint.connect_lazy()
        };

        tracing::debug!(
            host = %database_info.host,
            database = %database_info.database_id.name(),
            ssl = database_info.ssl_enabled,
            "Created lazy channel"
        );

        Ok(Self {
            database_info,
            channel,
            runtime,
            completion_queue,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn database_info(&self) -> &DatabaseInfo {
        &self.database_info
    }

    fn context(&self, rpc_name: &'static str, token: &Token) -> CallContext {
        CallContext {
            rpc_name,
            path: PathAndQuery::from_static(rpc_name),
            channel: self.channel.clone(),
            metadata: self.request_metadata(token),
            runtime: self.runtime.clone(),
            completion_queue: Arc::clone(&self.completion_queue),
            cancel: self.shutdown.child_token(),
        }
    }

    fn request_metadata(&self, token: &Token) -> MetadataMap {
        let mut metadata = MetadataMap::new();

        if let Some(value) = token.value() {
            match format!("Bearer {value}").parse::<AsciiMetadataValue>() {
                Ok(value) => {
                    metadata.insert("authorization", value);
                }
                Err(_) => tracing::warn!("Auth token is not a valid header value; sending none"),
            }
        }

        match self
            .database_info
            .database_id
            .name()
            .parse::<AsciiMetadataValue>()
        {
            Ok(value) => {
                metadata.insert("google-cloud-resource-prefix", value);
            }
            Err(_) => tracing::warn!("Database name is not a valid header value"),
        }

        metadata.insert(
            "x-goog-api-client",
            AsciiMetadataValue::from_static(API_CLIENT_HEADER),
        );

        metadata
    }
}

impl Connection for GrpcConnection {
    fn create_stream(
        &self,
        rpc_name: &'static str,
        token: &Token,
        observer: Arc<dyn GrpcStreamObserver>,
    ) -> Box<dyn GrpcStream> {
        Box::new(TonicStream::new(self.context(rpc_name, token), observer))
    }

    fn create_unary_call(&self, rpc_name: &'static str, token: &Token) -> Box<dyn GrpcUnaryCall> {
        Box::new(TonicUnaryCall::new(self.context(rpc_name, token)))
    }

    fn create_streaming_reader(
        &self,
        rpc_name: &'static str,
        token: &Token,
    ) -> Box<dyn GrpcStreamingReader> {
        Box::new(TonicStreamingReader::new(self.context(rpc_name, token)))
    }

    fn shutdown(&self) {
        tracing::debug!("Cancelling all calls on the connection");
        self.shutdown.cancel();
    }
}

/// Flattens response metadata into printable headers. Binary and non-ASCII
/// values are skipped.
pub(crate) fn metadata_to_map(metadata: &MetadataMap) -> Metadata {
    metadata
        .clone()
        .into_headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}
