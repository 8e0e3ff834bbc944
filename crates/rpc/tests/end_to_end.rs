//! Client, authenticator and server wired together over in-memory duplex
//! streams.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use perm::{
    BoxFuture, CallContext, Operation, OperationTable, PrivilegeSet, Shape, Template, bind,
};
use rpc::{
    APPLICATION_ERROR, AuthError, Authenticator, Client, ClientConfig, Connector, Error, Handler,
    Handshake, HandshakeReply, Headers, INVALID_PARAMS, JsonRpcResponse, Link, METHOD_NOT_FOUND,
    Request, Server, StaticTokens, Verifier,
};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

#[derive(Default)]
struct Counters {
    adds: AtomicUsize,
    verifies: AtomicUsize,
    connects: AtomicUsize,
}

/// Static tokens that count how often they are consulted.
struct Counting {
    tokens: StaticTokens,
    counters: Arc<Counters>,
}

impl Verifier for Counting {
    fn verify<'a>(
        &'a self,
        ctx: &'a CallContext,
        token: &'a str,
    ) -> BoxFuture<'a, Result<PrivilegeSet, AuthError>> {
        self.counters.verifies.fetch_add(1, Ordering::SeqCst);
        self.tokens.verify(ctx, token)
    }
}

type Gate = Authenticator<Counting, Server>;

fn calc_server(counters: &Arc<Counters>) -> Server {
    let template = Template::new("Calc")
        .slot("Add", Shape::Value, "admin")
        .slot("Todo", Shape::Value, "read")
        .slot("ChanSub", Shape::Stream, "read")
        .slot("Flood", Shape::Stream, "read")
        .slot("Watch", Shape::Stream, "read")
        .excluded("Internal", Shape::Unit);

    let adds = Arc::clone(counters);
    let implementation = OperationTable::new()
        .with(
            "Add",
            Operation::value("Add", move |_ctx, (a, b): (i64, i64)| {
                adds.adds.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, String>(a + b) }
            }),
        )
        .with(
            "Todo",
            Operation::value("Todo", |_ctx, (): ()| async { Ok::<_, String>("TODO") }),
        )
        .with(
            "ChanSub",
            Operation::stream("ChanSub", |_ctx, (): ()| async {
                let (tx, rx) = mpsc::channel(4);
                tokio::spawn(async move {
                    for _ in 0..3 {
                        if tx.send(true).await.is_err() {
                            return;
                        }
                    }
                });
                Ok::<_, String>(rx)
            }),
        )
        .with(
            "Flood",
            Operation::stream("Flood", |_ctx, (): ()| async {
                let (tx, rx) = mpsc::channel(4);
                tokio::spawn(async move {
                    for n in 0..FLOOD {
                        if tx.send(n).await.is_err() {
                            return;
                        }
                    }
                });
                Ok::<_, String>(rx)
            }),
        )
        .with(
            "Watch",
            Operation::stream("Watch", |_ctx, (): ()| async {
                let (tx, rx) = mpsc::channel(1);
                tokio::spawn(async move {
                    if tx.send(true).await.is_ok() {
                        tx.closed().await;
                    }
                });
                Ok::<_, String>(rx)
            }),
        )
        .with(
            "Internal",
            Operation::unit("Internal", |_ctx, (): ()| async { Ok::<_, String>(()) }),
        );

    let valid: PrivilegeSet = ["admin", "read"].into_iter().collect();
    let default: PrivilegeSet = ["read"].into_iter().collect();
    let proxy = bind(&valid, &default, &implementation, &template).unwrap();

    let mut server = Server::new();
    server.register("Calc", proxy);
    server
}

const FLOOD: usize = 200;

#[derive(Clone)]
struct Harness {
    gate: Arc<Gate>,
    counters: Arc<Counters>,
    sessions: Arc<Mutex<Vec<AbortHandle>>>,
    /// Upcoming connections that accept the handshake and then go quiet.
    silent: Arc<AtomicUsize>,
}

impl Harness {
    fn new(allow_anonymous: bool) -> Self {
        let counters = Arc::new(Counters::default());
        let tokens = StaticTokens::new()
            .with("admin-token", ["admin", "read"].into_iter().collect())
            .with("read-token", ["read"].into_iter().collect());
        let verifier = Counting {
            tokens,
            counters: Arc::clone(&counters),
        };
        let gate = Authenticator::new(verifier, calc_server(&counters))
            .allow_anonymous(allow_anonymous);
        Self {
            gate: Arc::new(gate),
            counters,
            sessions: Arc::new(Mutex::new(Vec::new())),
            silent: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn connector(&self) -> impl Connector {
        let harness = self.clone();
        move || {
            let harness = harness.clone();
            async move {
                harness.counters.connects.fetch_add(1, Ordering::SeqCst);
                let (client, server) = tokio::io::duplex(64 * 1024);
                let quiet = harness
                    .silent
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                let session = if quiet {
                    tokio::spawn(serve_silently(server))
                } else {
                    let gate = Arc::clone(&harness.gate);
                    tokio::spawn(async move {
                        let _ = gate.accept(CallContext::new(), server).await;
                    })
                };
                harness.sessions.lock().unwrap().push(session.abort_handle());
                Ok::<_, io::Error>(client)
            }
        }
    }

    /// Kill every server-side session, as if the network went away.
    fn drop_sessions(&self) {
        for session in self.sessions.lock().unwrap().drain(..) {
            session.abort();
        }
    }

    async fn client(&self, token: Option<&str>, config: ClientConfig) -> rpc::Result<Client> {
        let mut headers = Headers::new();
        if let Some(token) = token {
            headers.insert("Authorization", format!("Bearer {token}"));
        }
        Client::connect(self.connector(), "Calc", headers, config).await
    }

    fn count(&self, pick: impl Fn(&Counters) -> &AtomicUsize) -> usize {
        pick(&self.counters).load(Ordering::SeqCst)
    }
}

/// Accept the handshake, then neither read nor answer anything.
async fn serve_silently(io: tokio::io::DuplexStream) {
    let mut link = Link::new(io);
    if let Ok(Some(_)) = link.read::<Handshake>().await {
        let reply = HandshakeReply {
            accepted: true,
            reason: None,
        };
        if link.write(&reply).await.is_ok() {
            std::future::pending::<()>().await;
        }
    }
}

fn fast_reconnect() -> ClientConfig {
    ClientConfig::default()
        .with_reconnect_backoff(Duration::from_millis(10), Duration::from_millis(50))
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn admin_can_call_everything() {
    let harness = Harness::new(false);
    let client = harness
        .client(Some("admin-token"), ClientConfig::default())
        .await
        .unwrap();

    let sum: i64 = client.call("Add", (1, 2)).await.unwrap();
    assert_eq!(sum, 3);

    let todo: String = client.call("Todo", ()).await.unwrap();
    assert_eq!(todo, "TODO");

    let mut ticks = client.subscribe::<bool>("ChanSub", ()).await.unwrap();
    let mut seen = Vec::new();
    while let Some(item) = ticks.next().await {
        seen.push(item.unwrap());
    }
    assert_eq!(seen, [true, true, true]);
}

#[tokio::test]
async fn unread_subscription_does_not_stall_other_calls() {
    let harness = Harness::new(false);
    let client = harness
        .client(Some("admin-token"), ClientConfig::default())
        .await
        .unwrap();

    let mut flood = client.subscribe::<usize>("Flood", ()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let sum: i64 = tokio::time::timeout(Duration::from_secs(3), client.call("Add", (1, 2)))
        .await
        .expect("call stalled behind an unread stream")
        .unwrap();
    assert_eq!(sum, 3);

    // nothing was lost while the subscriber was away
    let mut seen = Vec::new();
    while let Some(item) = flood.next().await {
        seen.push(item.unwrap());
    }
    assert_eq!(seen, (0..FLOOD).collect::<Vec<_>>());
}

#[tokio::test]
async fn open_stream_reports_a_dropped_connection() {
    let harness = Harness::new(false);
    let client = harness
        .client(Some("read-token"), fast_reconnect())
        .await
        .unwrap();

    let mut watch = client.subscribe::<bool>("Watch", ()).await.unwrap();
    assert!(matches!(watch.next().await, Some(Ok(true))));

    harness.drop_sessions();

    let item = tokio::time::timeout(Duration::from_secs(5), watch.next())
        .await
        .unwrap();
    assert!(matches!(item, Some(Err(Error::ConnectionClosed))), "{item:?}");
    assert!(watch.next().await.is_none());
}

#[tokio::test]
async fn silent_server_is_detected_and_replaced() {
    let harness = Harness::new(false);
    harness.silent.store(1, Ordering::SeqCst);
    let config = fast_reconnect()
        .with_timeout(Duration::from_millis(400))
        .with_ping_interval(Duration::from_millis(150));
    let client = harness.client(Some("admin-token"), config).await.unwrap();

    // in flight on the quiet link: fails once the silence is noticed
    let result = tokio::time::timeout(Duration::from_secs(5), client.call::<i64>("Add", (1, 2)))
        .await
        .unwrap();
    assert!(matches!(result, Err(Error::ConnectionClosed)), "{result:?}");

    eventually(|| harness.count(|c| &c.connects) >= 2).await;
    let sum: i64 = tokio::time::timeout(Duration::from_secs(5), client.call("Add", (2, 3)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sum, 5);
    assert!(!client.is_closed());
    assert_eq!(harness.count(|c| &c.verifies), 1);
}

#[tokio::test]
async fn reader_is_denied_admin_operations() {
    let harness = Harness::new(false);
    let client = harness
        .client(Some("read-token"), ClientConfig::default())
        .await
        .unwrap();

    let err = client.call::<i64>("Add", (1, 2)).await.unwrap_err();
    let remote = match err {
        Error::JsonRpc(remote) => remote,
        other => panic!("expected a remote error, got {other:?}"),
    };
    assert_eq!(remote.code, APPLICATION_ERROR);
    assert!(remote.message.contains("admin"), "{}", remote.message);
    assert_eq!(harness.count(|c| &c.adds), 0);

    // read-level operations still work
    let todo: String = client.call("Todo", ()).await.unwrap();
    assert_eq!(todo, "TODO");
}

#[tokio::test]
async fn excluded_and_unknown_methods_are_not_found() {
    let harness = Harness::new(false);
    let client = harness
        .client(Some("admin-token"), ClientConfig::default())
        .await
        .unwrap();

    for method in ["Internal", "Nope"] {
        let err = client.call::<()>(method, ()).await.unwrap_err();
        assert!(
            matches!(&err, Error::JsonRpc(e) if e.code == METHOD_NOT_FOUND),
            "{method}: {err:?}"
        );
    }
}

#[tokio::test]
async fn bad_params_are_reported() {
    let harness = Harness::new(false);
    let client = harness
        .client(Some("admin-token"), ClientConfig::default())
        .await
        .unwrap();

    let err = client.call::<i64>("Add", ("one", 2)).await.unwrap_err();
    assert!(matches!(&err, Error::JsonRpc(e) if e.code == INVALID_PARAMS), "{err:?}");
    assert_eq!(harness.count(|c| &c.adds), 0);
}

#[tokio::test]
async fn unknown_token_fails_to_connect() {
    let harness = Harness::new(false);
    let err = harness
        .client(Some("nope"), ClientConfig::default())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::Auth(AuthError::Rejected(_))), "{err:?}");
}

#[tokio::test]
async fn missing_token_fails_unless_anonymous_allowed() {
    let harness = Harness::new(false);
    let err = harness
        .client(None, ClientConfig::default())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::Auth(_)), "{err:?}");

    let harness = Harness::new(true);
    let client = harness.client(None, ClientConfig::default()).await.unwrap();
    let todo: String = client.call("Todo", ()).await.unwrap();
    assert_eq!(todo, "TODO");
    // anonymous callers run with the default set
    assert!(client.call::<i64>("Add", (1, 2)).await.is_err());
    assert_eq!(harness.count(|c| &c.verifies), 0);
}

#[tokio::test]
async fn credential_is_verified_once_per_connection() {
    let harness = Harness::new(false);
    let client = harness
        .client(Some("admin-token"), ClientConfig::default())
        .await
        .unwrap();

    for i in 0..5i64 {
        let sum: i64 = client.call("Add", (i, i)).await.unwrap();
        assert_eq!(sum, 2 * i);
    }
    assert_eq!(harness.count(|c| &c.verifies), 1);
    assert_eq!(harness.count(|c| &c.adds), 5);
}

#[tokio::test]
async fn drop_is_terminal_without_reconnect() {
    let harness = Harness::new(false);
    let client = harness
        .client(Some("admin-token"), fast_reconnect().with_no_reconnect())
        .await
        .unwrap();
    let _: i64 = client.call("Add", (1, 2)).await.unwrap();

    harness.drop_sessions();

    let result = tokio::time::timeout(Duration::from_secs(5), client.call::<i64>("Add", (1, 2)))
        .await
        .unwrap();
    assert!(matches!(result, Err(Error::ConnectionClosed)), "{result:?}");

    eventually(|| client.is_closed()).await;
    assert!(matches!(
        client.call::<i64>("Add", (1, 2)).await,
        Err(Error::ConnectionClosed)
    ));
    assert_eq!(harness.count(|c| &c.connects), 1);
}

#[tokio::test]
async fn reconnects_after_a_drop() {
    let harness = Harness::new(false);
    let client = harness
        .client(Some("admin-token"), fast_reconnect())
        .await
        .unwrap();
    let _: i64 = client.call("Add", (1, 2)).await.unwrap();

    harness.drop_sessions();
    eventually(|| harness.count(|c| &c.connects) >= 2).await;

    let sum: i64 = tokio::time::timeout(Duration::from_secs(5), client.call("Add", (2, 2)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sum, 4);
    assert!(!client.is_closed());
    // the new connection authenticated afresh
    assert_eq!(harness.count(|c| &c.verifies), 2);
}

#[tokio::test]
async fn invalid_client_config_is_refused() {
    let harness = Harness::new(false);
    let config = ClientConfig::default()
        .with_timeout(Duration::from_secs(4))
        .with_ping_interval(Duration::from_secs(2));
    let err = harness
        .client(Some("admin-token"), config)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::Config(_)), "{err:?}");
    assert_eq!(harness.count(|c| &c.connects), 0);
}

fn add_request() -> Request {
    Request::new(r#"{"jsonrpc":"2.0","id":1,"method":"Calc.Add","params":[1,2]}"#)
}

#[tokio::test]
async fn request_response_is_gated() {
    let harness = Harness::new(false);

    let response = harness.gate.handle(CallContext::new(), add_request()).await;
    assert_eq!(response.status, 401);

    let request = add_request().with_header("Authorization", "Bearer admin-token");
    let response = harness.gate.handle(CallContext::new(), request).await;
    assert_eq!(response.status, 200);
    let parsed: JsonRpcResponse = serde_json::from_str(&response.body).unwrap();
    assert_eq!(parsed.into_result().unwrap(), serde_json::json!(3));

    let request = add_request().with_query("token", "read-token");
    let response = harness.gate.handle(CallContext::new(), request).await;
    let parsed: JsonRpcResponse = serde_json::from_str(&response.body).unwrap();
    assert_eq!(parsed.into_result().unwrap_err().code, APPLICATION_ERROR);
    assert_eq!(harness.count(|c| &c.adds), 1);
}
