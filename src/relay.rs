//! Relay pool: lazily connected WebSocket sessions to the configured relays,
//! with publish and time-boxed query primitives.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use futures_util::{future::join_all, stream::FuturesUnordered, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
    time::{timeout_at, Instant},
};
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::{
    client_async_tls, tungstenite::client::IntoClientRequest, tungstenite::Message,
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, warn};
use url::Url;

use crate::{
    event::Event,
    filter::Filter,
    message::{ClientMessage, RelayMessage},
};

const INBOUND_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay pool is closed")]
    PoolClosed,
    #[error("no relays configured")]
    NoRelays,
}

/// Tunables for a [`RelayPool`].
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// How long a publish waits for the first acknowledgement.
    pub publish_timeout: Duration,
    /// Optional SOCKS5 proxy (host:port) used for every relay connection.
    pub tor_socks: Option<String>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            publish_timeout: Duration::from_secs(3),
            tor_socks: None,
        }
    }
}

/// Result of submitting an event to the pool.
///
/// `Unconfirmed` means no relay answered before the timeout (or every relay
/// was unreachable); the event may still propagate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum PublishStatus {
    Confirmed { relay: String },
    Unconfirmed { errors: Vec<String> },
    Rejected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishOutcome {
    pub id: String,
    #[serde(flatten)]
    pub status: PublishStatus,
}

impl PublishOutcome {
    pub fn is_rejected(&self) -> bool {
        matches!(self.status, PublishStatus::Rejected { .. })
    }
}

/// Per-relay answer to a publish.
enum Ack {
    Accepted(String),
    Rejected(String, String),
    Failed(String, String),
}

/// A live socket owned by a background task.
struct Connection {
    outbound: mpsc::UnboundedSender<String>,
    /// Template receiver; callers resubscribe to observe frames from now on.
    inbound: broadcast::Receiver<RelayMessage>,
    task: JoinHandle<()>,
}

impl Connection {
    async fn open(url: &str, tor_socks: Option<&str>) -> Result<Self> {
        let ws = connect_ws(url, tor_socks).await?;
        let (mut sink, mut stream) = ws.split();
        let (outbound, mut rx) = mpsc::unbounded_channel::<String>();
        let (tx, inbound) = broadcast::channel(INBOUND_CAPACITY);
        let relay = url.to_string();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    out = rx.recv() => match out {
                        Some(txt) => {
                            if let Err(e) = sink.send(Message::Text(txt)).await {
                                warn!(relay = %relay, "send failed: {e}");
                                break;
                            }
                        }
                        None => break,
                    },
                    msg = stream.next() => match msg {
                        Some(Ok(Message::Text(txt))) => match RelayMessage::parse(&txt) {
                            Some(RelayMessage::Notice(notice)) => {
                                debug!(relay = %relay, "notice: {notice}");
                            }
                            Some(parsed) => {
                                let _ = tx.send(parsed);
                            }
                            None => debug!(relay = %relay, "ignoring frame: {txt}"),
                        },
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(relay = %relay, "read failed: {e}");
                            break;
                        }
                    },
                }
            }
            debug!(relay = %relay, "connection closed");
        });
        Ok(Self {
            outbound,
            inbound,
            task,
        })
    }

    fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }

    fn subscribe(&self) -> broadcast::Receiver<RelayMessage> {
        self.inbound.resubscribe()
    }

    fn send(&self, msg: &ClientMessage) -> Result<()> {
        self.outbound
            .send(msg.to_json())
            .map_err(|_| anyhow!("connection closed"))
    }
}

/// Pool of relay connections with an explicit `open`/`close` lifecycle.
///
/// Sockets are opened on first use and reopened on the next use after a
/// failure. After [`RelayPool::close`] every operation fails with
/// [`RelayError::PoolClosed`].
pub struct RelayPool {
    relays: Vec<String>,
    options: PoolOptions,
    slots: HashMap<String, Mutex<Option<Arc<Connection>>>>,
    closed: AtomicBool,
}

impl RelayPool {
    /// Build a pool for `relays` without connecting yet.
    pub fn open(relays: Vec<String>, options: PoolOptions) -> Self {
        let mut unique = Vec::new();
        for url in relays {
            if !unique.contains(&url) {
                unique.push(url);
            }
        }
        let slots = unique
            .iter()
            .map(|url| (url.clone(), Mutex::new(None)))
            .collect();
        Self {
            relays: unique,
            options,
            slots,
            closed: AtomicBool::new(false),
        }
    }

    pub fn relays(&self) -> &[String] {
        &self.relays
    }

    /// Tear down every connection. Idempotent.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for slot in self.slots.values() {
            if let Some(conn) = slot.lock().await.take() {
                conn.task.abort();
            }
        }
    }

    fn ensure_usable(&self) -> Result<(), RelayError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RelayError::PoolClosed);
        }
        if self.relays.is_empty() {
            return Err(RelayError::NoRelays);
        }
        Ok(())
    }

    async fn connection(&self, url: &str) -> Result<Arc<Connection>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RelayError::PoolClosed.into());
        }
        let slot = self
            .slots
            .get(url)
            .ok_or_else(|| anyhow!("unknown relay {url}"))?;
        let mut guard = slot.lock().await;
        if let Some(conn) = guard.as_ref() {
            if conn.is_alive() {
                return Ok(conn.clone());
            }
        }
        debug!(relay = %url, "connecting");
        let conn = Arc::new(Connection::open(url, self.options.tor_socks.as_deref()).await?);
        *guard = Some(conn.clone());
        Ok(conn)
    }

    /// Submit a signed event to every relay at once.
    ///
    /// Returns `Confirmed` on the first `OK true`. Without one, explicit
    /// `OK false` answers yield `Rejected`; otherwise the publish is
    /// `Unconfirmed` with the connection errors attached.
    pub async fn publish(&self, event: &Event) -> Result<PublishOutcome, RelayError> {
        self.ensure_usable()?;
        let msg = ClientMessage::Event(event.clone());
        let deadline = Instant::now() + self.options.publish_timeout;
        let mut pending: FuturesUnordered<_> = self
            .relays
            .iter()
            .map(|url| self.publish_to(url, &event.id, &msg))
            .collect();
        let mut rejections = Vec::new();
        let mut errors = Vec::new();
        loop {
            match timeout_at(deadline, pending.next()).await {
                Ok(Some(Ack::Accepted(relay))) => {
                    debug!(id = %event.id, relay = %relay, "publish confirmed");
                    return Ok(PublishOutcome {
                        id: event.id.clone(),
                        status: PublishStatus::Confirmed { relay },
                    });
                }
                Ok(Some(Ack::Rejected(relay, reason))) => {
                    warn!(id = %event.id, relay = %relay, "publish rejected: {reason}");
                    rejections.push(format!("{relay}: {reason}"));
                }
                Ok(Some(Ack::Failed(relay, err))) => {
                    warn!(id = %event.id, relay = %relay, "publish failed: {err}");
                    errors.push(format!("{relay}: {err}"));
                }
                Ok(None) => break,
                Err(_) => {
                    debug!(id = %event.id, "publish timed out without acknowledgement");
                    errors.push("timed out waiting for acknowledgement".into());
                    break;
                }
            }
        }
        let status = if rejections.is_empty() {
            PublishStatus::Unconfirmed { errors }
        } else {
            PublishStatus::Rejected {
                reason: rejections.join("; "),
            }
        };
        Ok(PublishOutcome {
            id: event.id.clone(),
            status,
        })
    }

    async fn publish_to(&self, url: &str, id: &str, msg: &ClientMessage) -> Ack {
        let conn = match self.connection(url).await {
            Ok(conn) => conn,
            Err(e) => return Ack::Failed(url.to_string(), e.to_string()),
        };
        let mut inbound = conn.subscribe();
        if let Err(e) = conn.send(msg) {
            return Ack::Failed(url.to_string(), e.to_string());
        }
        loop {
            match inbound.recv().await {
                Ok(RelayMessage::Ok {
                    event_id,
                    accepted,
                    message,
                }) if event_id == id => {
                    return if accepted {
                        Ack::Accepted(url.to_string())
                    } else {
                        Ack::Rejected(url.to_string(), message)
                    };
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Ack::Failed(url.to_string(), "connection closed".into());
                }
            }
        }
    }

    /// Collect events matching `filters` from every relay until each has sent
    /// `EOSE` or `timeout` elapses. Duplicates across relays are collapsed and
    /// events failing signature checks are dropped; order is unspecified.
    pub async fn query(&self, filters: Vec<Filter>, timeout: Duration) -> Result<Vec<Event>, RelayError> {
        self.ensure_usable()?;
        let deadline = Instant::now() + timeout;
        let sub_id = subscription_id();
        let results = join_all(
            self.relays
                .iter()
                .map(|url| self.query_relay(url, &sub_id, &filters, deadline)),
        )
        .await;
        let mut seen = HashSet::new();
        let mut events = Vec::new();
        for (url, result) in self.relays.iter().zip(results) {
            match result {
                Ok(batch) => {
                    for ev in batch {
                        if let Err(e) = ev.verify() {
                            debug!(relay = %url, id = %ev.id, "dropping invalid event: {e}");
                            continue;
                        }
                        if seen.insert(ev.id.clone()) {
                            events.push(ev);
                        }
                    }
                }
                Err(e) => warn!(relay = %url, "query failed: {e}"),
            }
        }
        Ok(events)
    }

    async fn query_relay(
        &self,
        url: &str,
        sub_id: &str,
        filters: &[Filter],
        deadline: Instant,
    ) -> Result<Vec<Event>> {
        let conn = timeout_at(deadline, self.connection(url))
            .await
            .map_err(|_| anyhow!("connect timed out"))??;
        let mut inbound = conn.subscribe();
        conn.send(&ClientMessage::Req {
            sub_id: sub_id.to_string(),
            filters: filters.to_vec(),
        })?;
        let mut events = Vec::new();
        loop {
            match timeout_at(deadline, inbound.recv()).await {
                Err(_) => {
                    debug!(relay = %url, sub = %sub_id, "query deadline reached");
                    break;
                }
                Ok(Ok(RelayMessage::Event { sub_id: s, event })) if s == sub_id => {
                    events.push(event)
                }
                Ok(Ok(RelayMessage::Eose(s))) if s == sub_id => break,
                Ok(Ok(RelayMessage::Closed { sub_id: s, message })) if s == sub_id => {
                    warn!(relay = %url, "subscription closed by relay: {message}");
                    return Ok(events);
                }
                Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => {}
                Ok(Err(broadcast::error::RecvError::Closed)) => break,
            }
        }
        let _ = conn.send(&ClientMessage::Close(sub_id.to_string()));
        Ok(events)
    }
}

/// Open a WebSocket to `relay` and close it again.
pub async fn probe(relay: &str, tor_socks: Option<&str>) -> Result<()> {
    let mut ws = connect_ws(relay, tor_socks).await?;
    ws.close(None).await?;
    Ok(())
}

fn subscription_id() -> String {
    format!("blueorb-{:016x}", rand::random::<u64>())
}

/// Establish a WebSocket connection, optionally via a SOCKS5 proxy.
async fn connect_ws(
    relay: &str,
    tor_socks: Option<&str>,
) -> Result<WebSocketStream<MaybeTlsStream<Box<dyn AsyncReadWrite + Unpin + Send>>>> {
    let url = Url::parse(relay)?;
    let host = url.host_str().ok_or_else(|| anyhow!("missing host"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| anyhow!("missing port"))?;
    let req = relay.into_client_request()?;
    let stream: Box<dyn AsyncReadWrite + Unpin + Send> = if let Some(proxy) = tor_socks {
        Box::new(Socks5Stream::connect(proxy, (host, port)).await?)
    } else {
        Box::new(TcpStream::connect((host, port)).await?)
    };
    let (ws, _) = client_async_tls(req, stream).await?;
    Ok(ws)
}

/// Blanket trait for boxed async read/write streams.
trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}
