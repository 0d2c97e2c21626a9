//! End-to-end tests for RelayServer

use simproxy_connection::FramedChannel;
use simproxy_server::{RelayServer, RelayServerConfig, RelayServerError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const STEP: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

struct TestRelay {
    server: Arc<RelayServer>,
    runner: JoinHandle<Result<(), RelayServerError>>,
    upstream: TcpListener,
}

async fn start_relay(max_agents: Option<usize>) -> TestRelay {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = RelayServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        upstream_host: "127.0.0.1".to_string(),
        upstream_port: upstream.local_addr().unwrap().port(),
        max_agents,
        ..Default::default()
    };

    let server = Arc::new(RelayServer::bind(config).await.unwrap());
    let runner = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    TestRelay {
        server,
        runner,
        upstream,
    }
}

async fn connect_agent(relay: &TestRelay) -> (FramedChannel, String) {
    let stream = TcpStream::connect(relay.server.local_addr()).await.unwrap();
    let local = stream.local_addr().unwrap().to_string();
    (FramedChannel::from_stream(stream), local)
}

async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = Instant::now() + STEP;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn has_agent(server: &RelayServer, peer: &str) -> bool {
    server.agents().iter().any(|agent| agent.peer() == peer)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_relays_each_agent_on_its_own_upstream_connection() {
    init_tracing();
    let relay = start_relay(None).await;

    let (agent1, peer1) = connect_agent(&relay).await;
    let (agent2, peer2) = connect_agent(&relay).await;
    wait_until(|| has_agent(&relay.server, &peer1) && has_agent(&relay.server, &peer2)).await;

    assert!(agent1.send(b"(scene one)").await.is_sent());
    let (stream, _) = timeout(STEP, relay.upstream.accept()).await.unwrap().unwrap();
    let upstream1 = FramedChannel::from_stream(stream);
    assert_eq!(&timeout(STEP, upstream1.receive()).await.unwrap().unwrap()[..], b"(scene one)");

    assert!(agent2.send(b"(scene two)").await.is_sent());
    let (stream, _) = timeout(STEP, relay.upstream.accept()).await.unwrap().unwrap();
    let upstream2 = FramedChannel::from_stream(stream);
    assert_eq!(&timeout(STEP, upstream2.receive()).await.unwrap().unwrap()[..], b"(scene two)");

    assert!(upstream2.send(b"(time (now 0.02))").await.is_sent());
    let perception = timeout(STEP, agent2.receive()).await.unwrap().unwrap();
    assert_eq!(&perception[..], b"(time (now 0.02))");

    let agents = relay.server.agents();
    assert_eq!(agents.len(), 2);
    assert_eq!(agents[0].peer(), peer1);
    assert_eq!(agents[1].peer(), peer2);
    assert!(agents.iter().all(|agent| agent.is_active()));
    assert!(relay.server.is_alive());

    relay.server.shutdown().await;
    assert!(timeout(STEP, relay.runner).await.unwrap().unwrap().is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_finished_agents_are_pruned_on_next_accept() {
    init_tracing();
    let relay = start_relay(None).await;

    let (agent1, peer1) = connect_agent(&relay).await;
    wait_until(|| has_agent(&relay.server, &peer1)).await;
    let first = relay.server.agents()[0].clone();

    agent1.disconnect().await;
    timeout(STEP, first.stopped()).await.unwrap();

    // Still listed until the next agent arrives
    assert_eq!(relay.server.agents().len(), 1);
    assert!(!relay.server.agents()[0].is_active());

    let (_agent2, peer2) = connect_agent(&relay).await;
    wait_until(|| has_agent(&relay.server, &peer2)).await;

    let agents = relay.server.agents();
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0].peer(), peer2);

    relay.server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_agents_beyond_limit_are_refused() {
    init_tracing();
    let relay = start_relay(Some(1)).await;

    let (_agent1, peer1) = connect_agent(&relay).await;
    wait_until(|| has_agent(&relay.server, &peer1)).await;

    let (agent2, _) = connect_agent(&relay).await;
    assert!(timeout(STEP, agent2.receive()).await.unwrap().is_none());

    assert_eq!(relay.server.agents().len(), 1);
    relay.server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_stops_agents_and_listener() {
    init_tracing();
    let relay = start_relay(None).await;
    let addr = relay.server.local_addr();

    let (agent, peer) = connect_agent(&relay).await;
    wait_until(|| has_agent(&relay.server, &peer)).await;
    let proxy = relay.server.agents()[0].clone();

    assert!(agent.send(b"(init)").await.is_sent());
    let (stream, _) = timeout(STEP, relay.upstream.accept()).await.unwrap().unwrap();
    let upstream = FramedChannel::from_stream(stream);
    assert_eq!(&timeout(STEP, upstream.receive()).await.unwrap().unwrap()[..], b"(init)");

    relay.server.shutdown().await;
    assert!(timeout(STEP, relay.runner).await.unwrap().unwrap().is_ok());

    assert!(proxy.is_stopped());
    assert!(relay.server.agents().is_empty());
    assert!(!relay.server.is_alive());
    assert!(timeout(STEP, agent.receive()).await.unwrap().is_none());

    // Drain the primed sync, then the upstream sees the close
    let mut closed = false;
    for _ in 0..2 {
        if timeout(STEP, upstream.receive()).await.unwrap().is_none() {
            closed = true;
            break;
        }
    }
    assert!(closed);

    assert!(TcpStream::connect(addr).await.is_err());

    // A second shutdown is harmless
    relay.server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bind_failure_is_reported() {
    init_tracing();
    let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = RelayServerConfig {
        bind_addr: taken.local_addr().unwrap(),
        ..Default::default()
    };

    match RelayServer::bind(config).await {
        Err(RelayServerError::BindError { port, .. }) => {
            assert_eq!(port, taken.local_addr().unwrap().port());
        }
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("bind unexpectedly succeeded"),
    }
}
