//! Persistent RPC client with reconnection.
//!
//! A [`Client`] owns one duplex connection at a time, managed by a
//! background task. When the connection drops, calls in flight on it fail
//! with [`Error::ConnectionClosed`], and the task reconnects with bounded
//! exponential backoff while new calls wait for the new link. With
//! reconnection disabled the first drop closes the client for good: every
//! pending and future call fails with [`Error::ConnectionClosed`].

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::io;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use perm::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior, timeout};

use crate::config::ClientConfig;
use crate::error::{AuthError, Error, Result};
use crate::link::{BoxConnection, Connection, FrameWriter, Link};
use crate::protocol::{
    CHANNEL_CLOSE, CHANNEL_VALUE, Handshake, HandshakeReply, Headers, JsonRpcRequest, Message,
    PING, RequestId,
};

/// Capacity of the queue between callers and the connection task.
const COMMAND_BUFFER: usize = 64;

/// Items of one open stream, as seen by its subscriber.
type Items = mpsc::UnboundedReceiver<Result<Value>>;

/// Connection-task side of an open stream. Unbounded so a subscriber that
/// stops reading never stalls the connection.
type ItemSender = mpsc::UnboundedSender<Result<Value>>;

/// Opens new byte streams to the server.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'_, io::Result<BoxConnection>>;
}

impl<F, Fut, C> Connector for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = io::Result<C>> + Send + 'static,
    C: Connection,
{
    fn connect(&self) -> BoxFuture<'_, io::Result<BoxConnection>> {
        let connecting = self();
        Box::pin(async move {
            let io = connecting.await?;
            Ok(Box::new(io) as BoxConnection)
        })
    }
}

enum Command {
    Call {
        method: String,
        params: Value,
        reply: oneshot::Sender<Result<Value>>,
    },
    Subscribe {
        method: String,
        params: Value,
        reply: oneshot::Sender<Result<Items>>,
    },
}

impl Command {
    fn fail(self, err: Error) {
        match self {
            Command::Call { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Command::Subscribe { reply, .. } => {
                let _ = reply.send(Err(err));
            }
        }
    }
}

/// A request written to the current link and awaiting its response.
enum Pending {
    Call(oneshot::Sender<Result<Value>>),
    Subscribe(oneshot::Sender<Result<Items>>),
    Ping,
}

impl Pending {
    fn fail(self, err: Error) {
        match self {
            Pending::Call(reply) => {
                let _ = reply.send(Err(err));
            }
            Pending::Subscribe(reply) => {
                let _ = reply.send(Err(err));
            }
            Pending::Ping => {}
        }
    }
}

/// Handle to a remote method table.
pub struct Client {
    namespace: String,
    commands: mpsc::Sender<Command>,
    closed: Arc<AtomicBool>,
}

/// Values delivered by a stream operation.
pub struct Subscription<T> {
    items: Items,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Subscription<T> {
    /// The next value, or `None` once the server closed the stream.
    ///
    /// If the connection drops while the stream is open, the last item is
    /// `Err(Error::ConnectionClosed)`.
    pub async fn next(&mut self) -> Option<Result<T>> {
        let item = self.items.recv().await?;
        Some(item.and_then(|value| serde_json::from_value(value).map_err(Error::from)))
    }
}

impl Client {
    /// Connect, authenticate with `headers`, and start the connection task.
    ///
    /// Fails if the first connection cannot be established or the server
    /// rejects the handshake.
    pub async fn connect(
        connector: impl Connector,
        namespace: impl Into<String>,
        headers: Headers,
        config: ClientConfig,
    ) -> Result<Self> {
        config.validate()?;
        let connector: Arc<dyn Connector> = Arc::new(connector);
        let link = handshake(connector.as_ref(), &headers, &config).await?;

        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let closed = Arc::new(AtomicBool::new(false));
        let namespace = namespace.into();
        let supervisor = Supervisor {
            connector,
            headers,
            config,
            namespace: namespace.clone(),
            commands: rx,
            queued: VecDeque::new(),
            next_id: 1,
            closed: Arc::clone(&closed),
        };
        tokio::spawn(supervisor.run(link));

        Ok(Self {
            namespace,
            commands: tx,
            closed,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// True once the client can no longer make calls.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Call a unit or value operation. Params are positional, e.g. `(1, 2)`.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: impl Serialize,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::Call {
            method: method.to_string(),
            params: serde_json::to_value(params)?,
            reply,
        })
        .await?;
        let value = rx.await.map_err(|_| Error::ConnectionClosed)??;
        Ok(serde_json::from_value(value)?)
    }

    /// Call a stream operation.
    pub async fn subscribe<T: DeserializeOwned>(
        &self,
        method: &str,
        params: impl Serialize,
    ) -> Result<Subscription<T>> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::Subscribe {
            method: method.to_string(),
            params: serde_json::to_value(params)?,
            reply,
        })
        .await?;
        let items = rx.await.map_err(|_| Error::ConnectionClosed)??;
        Ok(Subscription {
            items,
            _marker: PhantomData,
        })
    }

    async fn submit(&self, command: Command) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::ConnectionClosed)
    }
}

/// Open a stream and complete the authentication handshake on it.
async fn handshake(connector: &dyn Connector, headers: &Headers, config: &ClientConfig) -> Result<Link> {
    let io = timeout(config.timeout, connector.connect())
        .await
        .map_err(|_| Error::Timeout)??;
    let mut link = Link::new(io);
    link.write(&Handshake {
        headers: headers.clone(),
    })
    .await?;

    let reply = timeout(config.timeout, link.read::<HandshakeReply>())
        .await
        .map_err(|_| Error::Timeout)??
        .ok_or(Error::ConnectionClosed)?;
    if !reply.accepted {
        return Err(AuthError::Rejected(reply.reason.unwrap_or_default()).into());
    }
    Ok(link)
}

enum Ended {
    Dropped,
    ClientClosed,
}

struct Supervisor {
    connector: Arc<dyn Connector>,
    headers: Headers,
    config: ClientConfig,
    namespace: String,
    commands: mpsc::Receiver<Command>,
    /// Commands received while no link was up.
    queued: VecDeque<Command>,
    next_id: i64,
    closed: Arc<AtomicBool>,
}

impl Supervisor {
    async fn run(mut self, mut link: Link) {
        loop {
            match self.drive(link).await {
                Ended::ClientClosed => break,
                Ended::Dropped if self.config.no_reconnect => {
                    tracing::warn!(namespace = %self.namespace, "connection dropped, reconnect disabled");
                    break;
                }
                Ended::Dropped => {
                    tracing::warn!(namespace = %self.namespace, "connection dropped");
                }
            }
            link = match self.reconnect().await {
                Some(link) => link,
                None => break,
            };
        }
        self.shutdown();
    }

    /// Serve calls over `link` until it drops or the client goes away.
    async fn drive(&mut self, link: Link) -> Ended {
        let (mut reader, mut writer) = link.into_split();
        let mut pending: HashMap<i64, Pending> = HashMap::new();
        let mut streams: HashMap<u64, ItemSender> = HashMap::new();

        let mut ping = tokio::time::interval(self.config.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ping.tick().await;
        let mut last_seen = Instant::now();

        while let Some(command) = self.queued.pop_front() {
            if let Err(e) = self.send(&mut writer, &mut pending, command).await {
                tracing::debug!(error = %e, "write failed");
                return drop_link(pending, streams);
            }
        }

        loop {
            tokio::select! {
                line = reader.read_line() => match line {
                    Ok(Some(line)) => {
                        last_seen = Instant::now();
                        receive(&line, &mut pending, &mut streams);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(error = %e, "read failed");
                        break;
                    }
                },
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if let Err(e) = self.send(&mut writer, &mut pending, command).await {
                            tracing::debug!(error = %e, "write failed");
                            break;
                        }
                    }
                    None => {
                        let _ = writer.shutdown().await;
                        return Ended::ClientClosed;
                    }
                },
                _ = ping.tick() => {
                    if last_seen.elapsed() >= self.config.timeout {
                        tracing::warn!(timeout = ?self.config.timeout, "connection silent, dropping");
                        break;
                    }
                    let id = self.next_id();
                    if writer.write(&JsonRpcRequest::new(id, PING)).await.is_err() {
                        break;
                    }
                    pending.insert(id, Pending::Ping);
                }
            }
        }

        drop_link(pending, streams)
    }

    fn next_id(&mut self) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    async fn send(
        &mut self,
        writer: &mut FrameWriter,
        pending: &mut HashMap<i64, Pending>,
        command: Command,
    ) -> Result<()> {
        let id = self.next_id();
        let (method, params, entry) = match command {
            Command::Call {
                method,
                params,
                reply,
            } => (method, params, Pending::Call(reply)),
            Command::Subscribe {
                method,
                params,
                reply,
            } => (method, params, Pending::Subscribe(reply)),
        };

        let mut request = JsonRpcRequest::new(id, format!("{}.{method}", self.namespace));
        request.params = Some(params);
        match writer.write(&request).await {
            Ok(()) => {
                pending.insert(id, entry);
                Ok(())
            }
            Err(e) => {
                entry.fail(Error::ConnectionClosed);
                Err(e)
            }
        }
    }

    /// Back off and reconnect. Commands arriving meanwhile are queued.
    ///
    /// Returns `None` if the client went away or the server refused us.
    async fn reconnect(&mut self) -> Option<Link> {
        let backoff = self.config.backoff();
        let mut attempt = 0u32;

        loop {
            let delay = backoff.next(attempt);
            attempt = attempt.saturating_add(1);
            tracing::info!(attempt, delay = ?delay, "reconnecting");

            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    command = self.commands.recv() => match command {
                        Some(command) => self.queued.push_back(command),
                        None => return None,
                    },
                }
            }

            match handshake(self.connector.as_ref(), &self.headers, &self.config).await {
                Ok(link) => {
                    tracing::info!(attempt, "reconnected");
                    return Some(link);
                }
                Err(Error::Auth(e)) => {
                    tracing::warn!(error = %e, "reconnect rejected");
                    return None;
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "reconnect failed");
                }
            }
        }
    }

    /// Close for good: fail everything queued and refuse new commands.
    fn shutdown(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        self.commands.close();
        for command in self.queued.drain(..) {
            command.fail(Error::ConnectionClosed);
        }
        while let Ok(command) = self.commands.try_recv() {
            command.fail(Error::ConnectionClosed);
        }
        tracing::info!(namespace = %self.namespace, "client closed");
    }
}

/// Fail everything still waiting on a link that is gone.
fn drop_link(pending: HashMap<i64, Pending>, streams: HashMap<u64, ItemSender>) -> Ended {
    for (_, entry) in pending {
        entry.fail(Error::ConnectionClosed);
    }
    for (_, items) in streams {
        let _ = items.send(Err(Error::ConnectionClosed));
    }
    Ended::Dropped
}

/// Route one inbound frame to the call or stream waiting for it.
fn receive(line: &str, pending: &mut HashMap<i64, Pending>, streams: &mut HashMap<u64, ItemSender>) {
    let message = match serde_json::from_str::<Message>(line) {
        Ok(message) => message,
        Err(e) => {
            tracing::debug!(error = %e, "ignoring undecodable frame");
            return;
        }
    };

    match message {
        Message::Response(response) => {
            let Some(RequestId::Number(id)) = response.id else {
                return;
            };
            let Some(entry) = pending.remove(&id) else {
                return;
            };
            let result = response.into_result().map_err(Error::from);
            match entry {
                Pending::Call(reply) => {
                    let _ = reply.send(result);
                }
                Pending::Subscribe(reply) => {
                    let _ = reply.send(result.and_then(|value| open_stream(value, streams)));
                }
                Pending::Ping => {}
            }
        }
        Message::Request(request) => {
            let params = request.params.unwrap_or(Value::Null);
            match request.method.as_str() {
                CHANNEL_VALUE => {
                    let Ok((channel, value)) = serde_json::from_value::<(u64, Value)>(params)
                    else {
                        return;
                    };
                    let unsubscribed = streams
                        .get(&channel)
                        .is_some_and(|items| items.send(Ok(value)).is_err());
                    if unsubscribed {
                        streams.remove(&channel);
                    }
                }
                CHANNEL_CLOSE => {
                    if let Ok((channel,)) = serde_json::from_value::<(u64,)>(params) {
                        streams.remove(&channel);
                    }
                }
                other => tracing::debug!(method = other, "ignoring server request"),
            }
        }
    }
}

fn open_stream(value: Value, streams: &mut HashMap<u64, ItemSender>) -> Result<Items> {
    let channel = value
        .as_u64()
        .ok_or_else(|| Error::InvalidResponse(format!("expected channel id, got {value}")))?;
    let (tx, rx) = mpsc::unbounded_channel();
    streams.insert(channel, tx);
    Ok(rx)
}

