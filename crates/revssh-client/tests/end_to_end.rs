//! Broker and reverse client talking over real loopback sockets.

use revssh_client::{AgentSettings, AgentState, ReverseAgent};
use revssh_core::{
    BoxedStream, Dialer, MemoryAuthority, RevsshError, RevsshResult, Role, TransportAuthority,
};
use revssh_server::{ConnectionManager, ConnectionSettings, ReverseClientRegistry, RevsshServer};
use russh::client::{self, Handle};
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::Algorithm;
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use russh::ChannelMsg;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

fn random_key() -> PrivateKey {
    PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap()
}

/// Resolves `(host, port)` through a fixed table and records every dial.
/// Dials to a blackholed host never complete.
#[derive(Default)]
struct MapDialer {
    routes: Mutex<HashMap<(String, u16), SocketAddr>>,
    blackholes: Mutex<Vec<String>>,
    dials: Mutex<Vec<(String, u16)>>,
}

impl MapDialer {
    fn blackhole(&self, host: &str) {
        self.blackholes.lock().unwrap().push(host.to_string());
    }

    fn route(&self, host: &str, port: u16, to: SocketAddr) {
        self.routes
            .lock()
            .unwrap()
            .insert((host.to_string(), port), to);
    }

    fn dials(&self) -> Vec<(String, u16)> {
        self.dials.lock().unwrap().clone()
    }
}

impl Dialer for MapDialer {
    fn dial<'a>(
        &'a self,
        host: &'a str,
        port: u16,
    ) -> Pin<Box<dyn Future<Output = RevsshResult<BoxedStream>> + Send + 'a>> {
        self.dials.lock().unwrap().push((host.to_string(), port));
        let target = self
            .routes
            .lock()
            .unwrap()
            .get(&(host.to_string(), port))
            .copied();
        let hang = self.blackholes.lock().unwrap().iter().any(|h| h == host);
        Box::pin(async move {
            if hang {
                std::future::pending::<()>().await;
            }
            let addr = format!("{host}:{port}");
            let Some(target) = target else {
                return Err(RevsshError::Dial {
                    addr,
                    source: std::io::ErrorKind::ConnectionRefused.into(),
                });
            };
            let stream = TcpStream::connect(target)
                .await
                .map_err(|source| RevsshError::Dial { addr, source })?;
            Ok(Box::new(stream) as BoxedStream)
        })
    }
}

struct Broker {
    addr: SocketAddr,
    registry: Arc<ReverseClientRegistry>,
    dialer: Arc<MapDialer>,
}

async fn start_broker(authority: MemoryAuthority) -> Broker {
    start_broker_with(authority, ConnectionSettings::new(Role::Broker)).await
}

async fn start_broker_with(authority: MemoryAuthority, settings: ConnectionSettings) -> Broker {
    let registry = Arc::new(ReverseClientRegistry::new());
    let dialer = Arc::new(MapDialer::default());
    let manager = ConnectionManager::new(
        settings,
        Arc::new(authority),
        registry.clone(),
        dialer.clone(),
    )
    .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = RevsshServer::new(manager);
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    Broker {
        addr,
        registry,
        dialer,
    }
}

/// Client handler for the test user; trusts any host key.
struct TrustingClient;

impl client::Handler for TrustingClient {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

async fn login<S>(stream: S, user: &str, key: &PrivateKey) -> Handle<TrustingClient>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let config = Arc::new(client::Config::default());
    let mut handle = client::connect_stream(config, stream, TrustingClient)
        .await
        .unwrap();
    let auth = handle
        .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key.clone()), None))
        .await
        .unwrap();
    assert!(auth.success(), "{user} was not authenticated");
    handle
}

async fn wait_for_state(agent: &ReverseAgent, state: AgentState) {
    let mut rx = agent.state();
    timeout(WAIT, rx.wait_for(|s| *s == state))
        .await
        .expect("agent state timeout")
        .unwrap();
}

#[tokio::test]
async fn reverse_client_reachable_through_broker() {
    let broker_key = random_key();
    let agent_key = random_key();
    let user_key = random_key();

    let broker = start_broker(
        MemoryAuthority::new(vec![broker_key.clone()])
            .with_authorized_keys(vec![agent_key.public_key().clone()]),
    )
    .await;

    let agent_authority = Arc::new(
        MemoryAuthority::new(vec![agent_key])
            .with_authorized_keys(vec![user_key.public_key().clone()]),
    );
    let agent_dialer = Arc::new(MapDialer::default());
    let agent = Arc::new(
        ReverseAgent::new(
            AgentSettings::new(broker.addr.to_string(), "alice", "box1"),
            agent_authority.clone(),
        )
        .with_dialer(agent_dialer.clone()),
    );
    let runner = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.run().await })
    };
    wait_for_state(&agent, AgentState::Serving).await;

    let entry = broker.registry.lookup("BOX1", "alice").await.unwrap();
    assert_eq!(entry.keys.len(), 1);
    let recorded = agent_authority.known_host(&broker.addr.to_string()).unwrap();
    assert_eq!(&recorded, broker_key.public_key());

    // The user key is only known through the registration.
    let user = login(TcpStream::connect(broker.addr).await.unwrap(), "alice", &user_key).await;
    let channel = timeout(WAIT, user.channel_open_direct_tcpip("box1", 22, "127.0.0.1", 40000))
        .await
        .unwrap()
        .unwrap();

    let nested = login(channel.into_stream(), "alice", &user_key).await;
    let mut session = nested.channel_open_session().await.unwrap();
    session.request_shell(true).await.unwrap();

    let mut output = Vec::new();
    timeout(WAIT, async {
        while let Some(msg) = session.wait().await {
            match msg {
                ChannelMsg::Data { data } => {
                    output.extend_from_slice(&data);
                    if output.ends_with(b"\n\r") {
                        break;
                    }
                }
                ChannelMsg::Failure => panic!("shell request refused"),
                _ => {}
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(output, b"Welcome to alice\n\r");

    assert!(broker.dialer.dials().is_empty());
    assert!(agent_dialer.dials().is_empty());

    runner.abort();
}

#[tokio::test]
async fn direct_forward_reaches_listener() {
    let user_key = random_key();
    let broker = start_broker(
        MemoryAuthority::new(vec![random_key()])
            .with_authorized_keys(vec![user_key.public_key().clone()]),
    )
    .await;

    let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
    broker.dialer.route("box2", 4000, echo.local_addr().unwrap());
    tokio::spawn(async move {
        let (mut socket, _) = echo.accept().await.unwrap();
        let mut buf = [0u8; 4];
        socket.read_exact(&mut buf).await.unwrap();
        socket.write_all(&buf).await.unwrap();
    });

    let user = login(TcpStream::connect(broker.addr).await.unwrap(), "alice", &user_key).await;
    let channel = timeout(WAIT, user.channel_open_direct_tcpip("box2", 4000, "127.0.0.1", 40001))
        .await
        .unwrap()
        .unwrap();

    let mut stream = channel.into_stream();
    stream.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    timeout(WAIT, stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"ping");
    assert_eq!(broker.dialer.dials(), vec![("box2".to_string(), 4000)]);
}

#[tokio::test]
async fn direct_forward_without_listener_is_rejected() {
    let user_key = random_key();
    let broker = start_broker(
        MemoryAuthority::new(vec![random_key()])
            .with_authorized_keys(vec![user_key.public_key().clone()]),
    )
    .await;

    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    broker.dialer.route("box2", 4000, closed.local_addr().unwrap());
    drop(closed);

    let user = login(TcpStream::connect(broker.addr).await.unwrap(), "alice", &user_key).await;
    let result = timeout(WAIT, user.channel_open_direct_tcpip("box2", 4000, "127.0.0.1", 40002))
        .await
        .unwrap();
    assert!(result.is_err());
    assert_eq!(broker.dialer.dials(), vec![("box2".to_string(), 4000)]);
}

#[tokio::test]
async fn rejected_registration_stops_the_agent() {
    let agent_key = random_key();
    let broker_authority = MemoryAuthority::new(vec![random_key()])
        .with_authorized_keys(vec![agent_key.public_key().clone()]);
    // box1 was first seen with a different key
    broker_authority.trust_host("box1", random_key().public_key().clone());
    let broker = start_broker(broker_authority).await;

    let agent = ReverseAgent::new(
        AgentSettings::new(broker.addr.to_string(), "alice", "box1"),
        Arc::new(MemoryAuthority::new(vec![agent_key])),
    );
    let err = timeout(WAIT, agent.run()).await.unwrap().unwrap_err();
    assert!(matches!(err, RevsshError::RegistrationRejected));
    assert!(broker.registry.lookup("box1", "alice").await.is_none());
}

#[tokio::test]
async fn agent_retries_when_broker_refuses_its_key() {
    let broker = start_broker(MemoryAuthority::new(vec![random_key()])).await;
    let authority: Arc<dyn TransportAuthority> = Arc::new(MemoryAuthority::new(vec![random_key()]));
    let agent = ReverseAgent::new(
        AgentSettings::new(broker.addr.to_string(), "alice", "box1"),
        authority,
    );

    // still reconnecting, never fatal
    let outcome = timeout(Duration::from_secs(3), agent.run()).await;
    assert!(outcome.is_err());
    assert_eq!(broker.registry.count().await, 0);
}

#[tokio::test]
async fn stalled_forward_does_not_block_the_connection() {
    let user_key = random_key();
    let broker = start_broker_with(
        MemoryAuthority::new(vec![random_key()])
            .with_authorized_keys(vec![user_key.public_key().clone()]),
        ConnectionSettings::new(Role::Broker).with_forward_timeout(Duration::from_secs(1)),
    )
    .await;
    broker.dialer.blackhole("blackhole");

    let user = Arc::new(
        login(TcpStream::connect(broker.addr).await.unwrap(), "alice", &user_key).await,
    );
    let stalled = {
        let user = user.clone();
        tokio::spawn(async move {
            user.channel_open_direct_tcpip("blackhole", 1, "127.0.0.1", 40003)
                .await
        })
    };
    // let the stalled open reach the broker first
    while broker.dialer.dials().is_empty() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let session = timeout(Duration::from_secs(5), user.channel_open_session())
        .await
        .expect("connection stalled behind a pending forward");
    assert!(session.is_ok());

    let stalled = timeout(WAIT, stalled).await.unwrap().unwrap();
    assert!(stalled.is_err());
    assert_eq!(broker.dialer.dials(), vec![("blackhole".to_string(), 1)]);
}

#[tokio::test]
async fn unsupported_stream_types_are_refused() {
    let user_key = random_key();
    let broker = start_broker(
        MemoryAuthority::new(vec![random_key()])
            .with_authorized_keys(vec![user_key.public_key().clone()]),
    )
    .await;

    let user = login(TcpStream::connect(broker.addr).await.unwrap(), "alice", &user_key).await;
    let x11 = timeout(WAIT, user.channel_open_x11("127.0.0.1", 6010))
        .await
        .unwrap();
    assert!(x11.is_err());
    let streamlocal = timeout(WAIT, user.channel_open_direct_streamlocal("/tmp/agent.sock"))
        .await
        .unwrap();
    assert!(streamlocal.is_err());

    // the connection is still usable afterwards
    assert!(user.channel_open_session().await.is_ok());
    assert!(broker.dialer.dials().is_empty());
}

#[tokio::test]
async fn agent_shutdown_unregisters_from_broker() {
    let agent_key = random_key();
    let broker = start_broker(
        MemoryAuthority::new(vec![random_key()])
            .with_authorized_keys(vec![agent_key.public_key().clone()]),
    )
    .await;

    let agent = Arc::new(ReverseAgent::new(
        AgentSettings::new(broker.addr.to_string(), "alice", "box1"),
        Arc::new(MemoryAuthority::new(vec![agent_key])),
    ));
    let runner = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.run().await })
    };
    wait_for_state(&agent, AgentState::Serving).await;
    assert!(broker.registry.lookup("box1", "alice").await.is_some());
    assert_eq!(broker.registry.session_count().await, 1);

    agent.shutdown();
    timeout(WAIT, runner).await.unwrap().unwrap().unwrap();
    assert_eq!(*agent.state().borrow(), AgentState::Disconnected);

    timeout(WAIT, async {
        while broker.registry.lookup("box1", "alice").await.is_some()
            || broker.registry.session_count().await != 0
        {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("broker kept the registration");
}

#[tokio::test]
async fn aborted_agent_is_removed_from_registry() {
    let agent_key = random_key();
    let broker = start_broker(
        MemoryAuthority::new(vec![random_key()])
            .with_authorized_keys(vec![agent_key.public_key().clone()]),
    )
    .await;

    let agent = Arc::new(ReverseAgent::new(
        AgentSettings::new(broker.addr.to_string(), "alice", "box1"),
        Arc::new(MemoryAuthority::new(vec![agent_key])),
    ));
    let runner = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.run().await })
    };
    wait_for_state(&agent, AgentState::Serving).await;
    assert_eq!(broker.registry.count().await, 1);

    // no disconnect message; the broker sees the transport close
    runner.abort();
    let _ = runner.await;

    timeout(WAIT, async {
        while broker.registry.lookup("box1", "alice").await.is_some()
            || broker.registry.session_count().await != 0
        {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("registration outlived its connection");
}
