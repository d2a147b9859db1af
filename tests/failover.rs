mod common;

use std::{sync::Arc, time::Duration};

use common::{init_tracing, Behavior, BrokenFactory, TestServer};
use tcpgate::{
    connection::{blocking::BlockingConnectionFactory, reactor::ReactorConnectionFactory},
    error::{ConnectionError, GatewayError},
    factory::{CachingConnectionFactory, ConnectionFactory, FailoverConnectionFactory},
    OutboundGateway, SharedFactory,
};

#[tokio::test]
async fn send_failure_falls_over_to_next_candidate() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let server = TestServer::start(Behavior::Echo).await;
    let broken = Arc::new(BrokenFactory::default());
    let failover = FailoverConnectionFactory::new(vec![
        broken.clone() as SharedFactory,
        Arc::new(ReactorConnectionFactory::new(server.tcp_config())),
    ]);
    let gateway = OutboundGateway::new(failover);
    gateway.start();

    let reply = gateway.handle("Test").await?;
    assert_eq!(reply.as_deref(), Some(&b"Reply0"[..]));
    assert_eq!(broken.sends(), 1);
    assert_eq!(gateway.pending_replies(), 0);

    // The failover connection stays on the working candidate.
    let reply = gateway.handle("Test").await?;
    assert_eq!(reply.as_deref(), Some(&b"Reply1"[..]));
    assert_eq!(broken.sends(), 1);
    Ok(())
}

#[tokio::test]
async fn every_candidate_failing_reports_exhaustion() {
    init_tracing();
    let first = Arc::new(BrokenFactory::default());
    let second = Arc::new(BrokenFactory::default());
    let gateway = OutboundGateway::new(FailoverConnectionFactory::new(vec![
        first.clone() as SharedFactory,
        second.clone(),
    ]));
    gateway.start();

    match gateway.handle("Test").await {
        Err(GatewayError::Connection(ConnectionError::Exhausted { attempts, last })) => {
            assert_eq!(attempts, 2);
            match *last {
                ConnectionError::Send(err) => {
                    assert_eq!(err.source.kind(), std::io::ErrorKind::BrokenPipe)
                }
                other => panic!("expected the last send to be the cause, got {other:?}"),
            }
        }
        other => panic!("expected exhaustion, got {other:?}"),
    }
    assert_eq!(first.sends(), 1);
    assert_eq!(second.sends(), 1);
    assert_eq!(gateway.pending_replies(), 0);
}

#[tokio::test]
async fn unreachable_candidates_are_skipped() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let server = TestServer::start(Behavior::Echo).await;
    let unreachable = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        listener.local_addr()?
    };
    let gateway = OutboundGateway::new(FailoverConnectionFactory::new(vec![
        Arc::new(ReactorConnectionFactory::new(
            common::tcp_config(unreachable).connect_timeout(Duration::from_secs(1)),
        )) as SharedFactory,
        Arc::new(BlockingConnectionFactory::new(server.tcp_config())),
    ]));
    gateway.start();

    assert_eq!(gateway.handle("Test").await?.as_deref(), Some(&b"Reply0"[..]));
    Ok(())
}

#[tokio::test]
async fn empty_candidate_list_is_rejected() {
    init_tracing();
    let gateway = OutboundGateway::new(FailoverConnectionFactory::new(Vec::new()));
    gateway.start();
    assert!(matches!(
        gateway.handle("Test").await,
        Err(GatewayError::Connection(ConnectionError::NoCandidates))
    ));
}

#[tokio::test]
async fn stopped_candidate_exhausts_acquisition() {
    init_tracing();
    let factory =
        FailoverConnectionFactory::new(vec![Arc::new(BrokenFactory::default()) as SharedFactory]);
    factory.start();
    factory.candidates()[0].stop();

    match factory.get_connection().await {
        Err(ConnectionError::Exhausted { attempts, last }) => {
            assert_eq!(attempts, 1);
            assert!(matches!(*last, ConnectionError::Stopped));
        }
        other => panic!("expected exhaustion, got {other:?}"),
    }
}

#[tokio::test]
async fn failover_over_caching_factories() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let server = TestServer::start(Behavior::Echo).await;
    let broken = Arc::new(BrokenFactory::default());
    let pooled = Arc::new(CachingConnectionFactory::new(
        ReactorConnectionFactory::new(server.tcp_config().single_use(true)),
        2,
    ));
    let failover = FailoverConnectionFactory::new(vec![
        Arc::new(CachingConnectionFactory::new(broken.clone(), 2)) as SharedFactory,
        pooled.clone(),
    ])
    .single_use(true);
    let gateway = OutboundGateway::new(failover);
    gateway.start();

    for n in 0..3 {
        let reply = gateway.handle("Test").await?;
        assert_eq!(reply.as_deref(), Some(format!("Reply{n}").as_bytes()));
        // Finishing the failover connection hands its delegate back to the pool.
        assert_eq!(pooled.active_count(), 0);
        assert_eq!(pooled.idle_count(), 1);
    }
    assert_eq!(broken.sends(), 3);
    assert_eq!(server.accepted(), 1);
    Ok(())
}

#[tokio::test]
async fn caching_over_failover_factory() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let server = TestServer::start(Behavior::Echo).await;
    let broken = Arc::new(BrokenFactory::default());
    let failover = FailoverConnectionFactory::new(vec![
        broken.clone() as SharedFactory,
        Arc::new(ReactorConnectionFactory::new(server.tcp_config().single_use(true))),
    ])
    .single_use(true);
    let cache = Arc::new(CachingConnectionFactory::new(failover, 2));
    let gateway = OutboundGateway::new(cache.clone());
    gateway.start();

    for n in 0..3 {
        let reply = gateway.handle("Test").await?;
        assert_eq!(reply.as_deref(), Some(format!("Reply{n}").as_bytes()));
    }
    // The pooled failover connection settled on the working candidate after one failure.
    assert_eq!(broken.sends(), 1);
    assert_eq!(cache.idle_count(), 1);
    assert_eq!(server.accepted(), 1);
    Ok(())
}
