//! # Event bus for job status, progress, results and log messages.
//!
//! [`EventBus`] delivers every published [`Message`] through a list of
//! [`Transport`] backends that share one contract: messages from a single
//! publisher reach each consumer in the order they were published.
//!
//! ## Architecture
//! ```text
//! Worker ──publish──► EventBus ──► LocalTransport ──► Recorder, listeners (mpsc, lossless)
//!                          │
//!                          └─────► TcpMirror ──► remote subscribers (broadcast, best-effort)
//! ```
//!
//! ## Rules
//! - **Non-blocking publish**: `publish()` never awaits; local delivery uses unbounded
//!   channels and the mirror uses a bounded broadcast ring.
//! - **Local is lossless**: a local subscriber sees every matching message published
//!   after it subscribed. Dropped subscriptions are pruned on the next publish.
//! - **Remote is best-effort**: a remote reader that falls behind skips the oldest
//!   messages (logged as a lag); one that connects late misses what came before.
//! - **No replay or acknowledgment** on either path.
//!
//! ## Wire format
//! Each mirrored message is one line: the topic, a space, and the JSON-encoded
//! [`Message`]. A connection starts with a single banner line ([`MIRROR_BANNER`])
//! sent once the connection has been attached to the stream.

use crate::config::BusSettings;
use crate::error::{AppResult, DaqError};
use crate::job::JobId;
use crate::messages::{Message, Topic};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// First line written to every mirror connection.
pub const MIRROR_BANNER: &str = "# daq_runner mirror v1";

const ACCEPT_RETRY_BASE: Duration = Duration::from_millis(10);
const ACCEPT_RETRY_MAX: Duration = Duration::from_secs(1);

// =============================================================================
// Transport trait
// =============================================================================

/// A delivery backend.
///
/// `deliver` is called once per published message, in publish order, and must not
/// block.
pub trait Transport: Send + Sync {
    /// Short name for diagnostics.
    fn name(&self) -> &'static str;

    /// Hand one message to this backend's consumers.
    fn deliver(&self, message: &Message);
}

// =============================================================================
// Subscriptions
// =============================================================================

/// Which messages a local subscription receives.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    topics: Option<Vec<Topic>>,
    job: Option<JobId>,
}

impl Filter {
    /// Every message.
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to these topics.
    pub fn topics(mut self, topics: impl IntoIterator<Item = Topic>) -> Self {
        self.topics = Some(topics.into_iter().collect());
        self
    }

    /// Restrict to one job.
    pub fn job(mut self, job: JobId) -> Self {
        self.job = Some(job);
        self
    }

    /// Whether `message` passes.
    pub fn matches(&self, message: &Message) -> bool {
        let topic_ok = self
            .topics
            .as_ref()
            .map_or(true, |topics| topics.contains(&message.topic()));
        let job_ok = self.job.map_or(true, |job| job == message.job);
        topic_ok && job_ok
    }
}

/// Receiving end of a local subscription.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Message>,
}

impl Subscription {
    /// Next message; `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Next message if one is already waiting.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

struct LocalSubscriber {
    filter: Filter,
    tx: mpsc::UnboundedSender<Message>,
}

/// In-process fan-out to [`Subscription`]s.
#[derive(Default)]
pub struct LocalTransport {
    subscribers: Mutex<Vec<LocalSubscriber>>,
}

impl LocalTransport {
    /// Register a new subscriber.
    pub fn subscribe(&self, filter: Filter) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(LocalSubscriber { filter, tx });
        Subscription { rx }
    }

    /// Live subscriber count.
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| !s.tx.is_closed());
        subscribers.len()
    }
}

impl Transport for LocalTransport {
    fn name(&self) -> &'static str {
        "local"
    }

    fn deliver(&self, message: &Message) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| {
            if !s.filter.matches(message) {
                return !s.tx.is_closed();
            }
            s.tx.send(message.clone()).is_ok()
        });
    }
}

// =============================================================================
// TCP mirror
// =============================================================================

/// Encode one message as a mirror line (without the trailing newline).
pub fn encode_line(message: &Message) -> AppResult<String> {
    let json = serde_json::to_string(message)
        .map_err(|e| DaqError::Bus(format!("failed to encode message: {e}")))?;
    Ok(format!("{} {}", message.topic(), json))
}

/// Decode a mirror line produced by [`encode_line`].
pub fn decode_line(line: &str) -> AppResult<Message> {
    let (topic, json) = line
        .split_once(' ')
        .ok_or_else(|| DaqError::Bus(format!("malformed mirror line: {line}")))?;
    let message: Message = serde_json::from_str(json)
        .map_err(|e| DaqError::Bus(format!("failed to decode message: {e}")))?;
    if message.topic().as_str() != topic {
        return Err(DaqError::Bus(format!(
            "topic prefix '{topic}' does not match payload topic '{}'",
            message.topic()
        )));
    }
    Ok(message)
}

/// Broadcasts every message to any number of TCP clients.
pub struct TcpMirror {
    tx: broadcast::Sender<Arc<str>>,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl TcpMirror {
    /// Bind `address` and start accepting subscribers.
    pub async fn bind(address: &str, capacity: usize) -> AppResult<Self> {
        let listener = TcpListener::bind(address).await?;
        let local_addr = listener.local_addr()?;
        let (tx, _rx) = broadcast::channel::<Arc<str>>(capacity.max(1));

        let accept_tx = tx.clone();
        let accept_task = tokio::spawn(async move {
            let mut failures = 0u32;
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        failures = 0;
                        let rx = accept_tx.subscribe();
                        tokio::spawn(serve_subscriber(stream, peer, rx));
                    }
                    Err(e) => {
                        // Errors such as EMFILE persist until a descriptor frees up.
                        failures = failures.saturating_add(1);
                        let delay = accept_retry_delay(failures);
                        warn!("mirror accept failed: {e}; retrying in {delay:?}");
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        });

        info!("Event bus mirror listening on {local_addr}");
        Ok(Self {
            tx,
            local_addr,
            accept_task,
        })
    }

    /// Actual bound address (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Transport for TcpMirror {
    fn name(&self) -> &'static str {
        "tcp-mirror"
    }

    fn deliver(&self, message: &Message) {
        match encode_line(message) {
            Ok(line) => {
                // No receivers simply means nobody is listening.
                let _ = self.tx.send(Arc::from(line));
            }
            Err(e) => warn!("dropping unmirrorable message: {e}"),
        }
    }
}

impl Drop for TcpMirror {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// Backoff after the `failures`-th consecutive accept error: doubles from 10 ms, capped at 1 s.
fn accept_retry_delay(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    ACCEPT_RETRY_BASE
        .saturating_mul(1 << exponent)
        .min(ACCEPT_RETRY_MAX)
}

async fn serve_subscriber(
    mut stream: TcpStream,
    peer: SocketAddr,
    mut rx: broadcast::Receiver<Arc<str>>,
) {
    debug!("mirror subscriber connected: {peer}");
    if stream
        .write_all(format!("{MIRROR_BANNER}\n").as_bytes())
        .await
        .is_err()
    {
        return;
    }
    loop {
        match rx.recv().await {
            Ok(line) => {
                let mut buf = Vec::with_capacity(line.len() + 1);
                buf.extend_from_slice(line.as_bytes());
                buf.push(b'\n');
                if let Err(e) = stream.write_all(&buf).await {
                    debug!("mirror subscriber {peer} went away: {e}");
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("mirror subscriber {peer} lagged, skipped {skipped} messages");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Client side of the TCP mirror.
pub struct RemoteSubscriber {
    lines: tokio::io::Lines<BufReader<TcpStream>>,
    topics: Option<Vec<Topic>>,
}

impl RemoteSubscriber {
    /// Connect and wait until the mirror has attached this connection.
    pub async fn connect(address: SocketAddr) -> AppResult<Self> {
        let stream = TcpStream::connect(address).await?;
        let mut lines = BufReader::new(stream).lines();
        match lines.next_line().await? {
            Some(banner) if banner == MIRROR_BANNER => {}
            Some(other) => {
                return Err(DaqError::Bus(format!("unexpected mirror banner: {other}")))
            }
            None => return Err(DaqError::Bus("mirror closed before banner".to_string())),
        }
        Ok(Self {
            lines,
            topics: None,
        })
    }

    /// Only yield these topics.
    pub fn with_topics(mut self, topics: impl IntoIterator<Item = Topic>) -> Self {
        self.topics = Some(topics.into_iter().collect());
        self
    }

    /// Next message; `None` when the mirror closes the connection.
    pub async fn recv(&mut self) -> AppResult<Option<Message>> {
        while let Some(line) = self.lines.next_line().await? {
            if let Some(topics) = &self.topics {
                let topic = line.split(' ').next().unwrap_or_default();
                if !topics.iter().any(|t| t.as_str() == topic) {
                    continue;
                }
            }
            return decode_line(&line).map(Some);
        }
        Ok(None)
    }
}

// =============================================================================
// EventBus
// =============================================================================

struct BusInner {
    local: Arc<LocalTransport>,
    transports: Vec<Arc<dyn Transport>>,
    mirror_addr: Option<SocketAddr>,
}

/// Cloneable handle to the bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.inner.transports.iter().map(|t| t.name()).collect();
        f.debug_struct("EventBus")
            .field("transports", &names)
            .field("mirror_addr", &self.inner.mirror_addr)
            .finish()
    }
}

impl EventBus {
    /// In-process delivery only.
    pub fn local() -> Self {
        let local = Arc::new(LocalTransport::default());
        Self {
            inner: Arc::new(BusInner {
                transports: vec![local.clone() as Arc<dyn Transport>],
                local,
                mirror_addr: None,
            }),
        }
    }

    /// Local delivery plus a TCP mirror on `address`.
    pub async fn mirrored(address: &str, capacity: usize) -> AppResult<Self> {
        let local = Arc::new(LocalTransport::default());
        let mirror = TcpMirror::bind(address, capacity).await?;
        let mirror_addr = Some(mirror.local_addr());
        Ok(Self {
            inner: Arc::new(BusInner {
                transports: vec![local.clone() as Arc<dyn Transport>, Arc::new(mirror)],
                local,
                mirror_addr,
            }),
        })
    }

    /// Pick the backends from configuration.
    pub async fn from_settings(settings: &BusSettings) -> AppResult<Self> {
        if settings.mirror.enabled {
            Self::mirrored(&settings.mirror.address(), settings.capacity).await
        } else {
            Ok(Self::local())
        }
    }

    /// Deliver `message` through every transport, in order.
    pub fn publish(&self, message: Message) {
        for transport in &self.inner.transports {
            transport.deliver(&message);
        }
    }

    /// Subscribe locally.
    pub fn subscribe(&self, filter: Filter) -> Subscription {
        self.inner.local.subscribe(filter)
    }

    /// Number of live local subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner.local.subscriber_count()
    }

    /// Address of the TCP mirror, when enabled.
    pub fn mirror_addr(&self) -> Option<SocketAddr> {
        self.inner.mirror_addr
    }
}
