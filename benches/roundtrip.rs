use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use tcpgate::{
    codec::{CodecConfig, CrLfCodec},
    connection::reactor::ReactorConnectionFactory,
    factory::CachingConnectionFactory,
    OutboundGateway, TcpConfig,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpListener,
    runtime::Builder,
};

async fn echo_server() -> TcpConfig {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (read_half, mut write_half) = socket.into_split();
                let mut lines = BufReader::new(read_half).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if write_half
                        .write_all(format!("{line}\r\n").as_bytes())
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            });
        }
    });
    TcpConfig::new("127.0.0.1", addr.port()).codec(CodecConfig::CrLf {
        max_frame_len: CrLfCodec::DEFAULT_MAX_FRAME_LEN,
    })
}

fn gateway_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("Gateway round trip");
    let rt = Builder::new_multi_thread().enable_all().build().unwrap();

    group.bench_function("shared_connection", |b| {
        let gateway = rt.block_on(async {
            let gateway = OutboundGateway::new(ReactorConnectionFactory::new(echo_server().await));
            gateway.start();
            gateway
        });
        b.to_async(&rt).iter(|| async {
            gateway.handle("ping").await.unwrap();
        });
    });

    group.bench_function("single_use_connection", |b| {
        let gateway = rt.block_on(async {
            let config = echo_server().await.single_use(true);
            let gateway = OutboundGateway::new(ReactorConnectionFactory::new(config));
            gateway.start();
            gateway
        });
        b.to_async(&rt).iter(|| async {
            gateway.handle("ping").await.unwrap();
        });
    });

    group.bench_function("pooled_connection", |b| {
        let gateway = rt.block_on(async {
            let config = echo_server().await.single_use(true);
            let gateway = OutboundGateway::new(CachingConnectionFactory::new(
                ReactorConnectionFactory::new(config),
                4,
            ));
            gateway.start();
            Arc::new(gateway)
        });
        b.to_async(&rt).iter(|| {
            let gateway = gateway.clone();
            async move {
                gateway.handle("ping").await.unwrap();
            }
        });
    });

    group.finish();
}

criterion_group!(benches, gateway_benchmarks);
criterion_main!(benches);
