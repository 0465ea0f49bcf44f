use core::hint::black_box;
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use firestore_remote::{
    auth::{EmptyCredentialsProvider, Token},
    remote::{
        Connection, Datastore, GrpcStream, GrpcStreamObserver, GrpcStreamingReader,
        GrpcUnaryCall, RemoteSerializer,
    },
    util::AsyncQueue,
};
use firestore_remote_core::DatabaseId;
use std::sync::Arc;
use tokio::{runtime::Builder, sync::oneshot};

/// A connection that is never asked for a call; the benchmarks only exercise
/// completion delivery.
struct IdleConnection;

impl Connection for IdleConnection {
    fn create_stream(
        &self,
        _rpc_name: &'static str,
        _token: &Token,
        _observer: Arc<dyn GrpcStreamObserver>,
    ) -> Box<dyn GrpcStream> {
        unimplemented!("idle connection creates no streams")
    }

    fn create_unary_call(&self, _rpc_name: &'static str, _token: &Token) -> Box<dyn GrpcUnaryCall> {
        unimplemented!("idle connection creates no calls")
    }

    fn create_streaming_reader(
        &self,
        _rpc_name: &'static str,
        _token: &Token,
    ) -> Box<dyn GrpcStreamingReader> {
        unimplemented!("idle connection creates no calls")
    }

    fn shutdown(&self) {}
}

fn completion_bench(c: &mut Criterion) {
    let rt = Builder::new_multi_thread().enable_all().build().unwrap();
    let queue = AsyncQueue::new("bench-worker", rt.handle().clone()).unwrap();
    let datastore = Datastore::with_connection(
        Arc::clone(&queue),
        Arc::new(EmptyCredentialsProvider),
        Arc::new(RemoteSerializer::new(DatabaseId::with_default_database("bench"))),
        |_| Ok(Box::new(IdleConnection)),
    )
    .unwrap();

    for batch in [1u64, 64, 1024] {
        let mut group = c.benchmark_group("completion_queue/deliver");
        group.throughput(Throughput::Elements(batch));
        group.bench_function(format!("batch/{batch}"), |b| {
            b.to_async(&rt).iter(|| deliver(&datastore, batch));
        });
        group.finish();
    }

    let mut group = c.benchmark_group("worker_queue");
    group.throughput(Throughput::Elements(1));
    group.bench_function("run", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(queue.run(|| 42).await.unwrap()) });
    });
    group.finish();

    let worker = Arc::clone(&datastore);
    rt.block_on(queue.run(move || worker.shutdown())).unwrap();
    queue.shutdown();
}

/// Posts `batch` completions and waits until the last one has run on the
/// worker queue.
async fn deliver(datastore: &Datastore, batch: u64) {
    let (tx, rx) = oneshot::channel();
    let op = datastore
        .completion_queue()
        .begin()
        .expect("completion queue shut down");
    for i in 1..batch {
        op.post(move || {
            black_box(i);
        });
    }
    op.post(move || {
        let _ = tx.send(());
    });
    drop(op);
    rx.await.expect("completion dropped");
}

criterion_group!(benches, completion_bench);
criterion_main!(benches);
