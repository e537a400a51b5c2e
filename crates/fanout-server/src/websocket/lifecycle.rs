//! Connection lifecycle: `Connecting → Active → Closing → Closed`.
//!
//! A connection is registered before its account is announced, and removed
//! before its account is retracted. Cleanup is owned by a
//! [`Registration`] guard, so it runs exactly once whether the read loop
//! ends on an error, a clean close, a local close request, shutdown, or the
//! task being aborted.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use fanout_core::{AccountId, ConnectionId, HandshakeError, HostId};
use fanout_presence::PresenceDirectory;
use futures::{Sink, SinkExt, Stream, StreamExt};
use metrics::{counter, gauge, histogram};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::connection::ClientConnection;
use super::frames::ServerFrame;
use crate::metrics::{
    DIRECTORY_ERRORS_TOTAL, WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE,
    WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL, WS_HEARTBEAT_TIMEOUTS_TOTAL,
};
use crate::registry::ConnectionRegistry;

/// How long the writer gets to flush its Close frame before it is aborted.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle state of one connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    /// Handshake in progress; nothing registered.
    Connecting,
    /// Registered and reading frames.
    Active,
    /// Read loop finished; cleanup running.
    Closing,
    /// Terminal.
    Closed,
}

/// Per-connection timing and buffering.
#[derive(Clone, Copy, Debug)]
pub struct LifecycleConfig {
    /// Interval between server-initiated Ping frames.
    pub heartbeat_interval: Duration,
    /// How long without a Pong before the client is considered dead.
    pub heartbeat_timeout: Duration,
    /// Outbound frames buffered per connection.
    pub send_buffer: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            send_buffer: 256,
        }
    }
}

/// Validate the account id presented at upgrade time.
pub fn handshake(account: Option<&str>) -> Result<AccountId, HandshakeError> {
    account
        .and_then(AccountId::parse)
        .ok_or(HandshakeError::MissingAccount)
}

/// Drives connections through their lifecycle on this host.
pub struct ConnectionLifecycle {
    host: HostId,
    registry: Arc<ConnectionRegistry>,
    presence: PresenceDirectory,
    config: LifecycleConfig,
    shutdown: CancellationToken,
}

impl ConnectionLifecycle {
    /// Create a lifecycle driver. Connection tokens are children of
    /// `shutdown`.
    pub fn new(
        host: HostId,
        registry: Arc<ConnectionRegistry>,
        presence: PresenceDirectory,
        config: LifecycleConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            host,
            registry,
            presence,
            config,
            shutdown,
        }
    }

    /// Run one connection to completion.
    ///
    /// `reader` yields inbound frames; `writer` accepts outbound frames and
    /// is driven by a dedicated task that also sends heartbeats. Returns the
    /// terminal state, which is always [`LifecycleState::Closed`].
    #[instrument(skip_all, fields(account = %account, conn_id = %conn_id))]
    pub async fn run<R, W, E>(
        &self,
        mut reader: R,
        writer: W,
        account: AccountId,
        conn_id: ConnectionId,
    ) -> LifecycleState
    where
        R: Stream<Item = Result<Message, E>> + Unpin + Send,
        W: Sink<Message> + Unpin + Send + 'static,
        W::Error: fmt::Display + Send,
        E: fmt::Display + Send,
    {
        let mut state = LifecycleState::Connecting;
        if self.shutdown.is_cancelled() {
            debug!(?state, "shutting down, connection refused");
            return LifecycleState::Closed;
        }

        let (tx, rx) = mpsc::channel(self.config.send_buffer.max(1));
        let cancel = self.shutdown.child_token();
        let connection = Arc::new(ClientConnection::new(
            conn_id.clone(),
            account.clone(),
            tx,
            cancel.clone(),
        ));

        let registration = Registration::register(
            self.registry.clone(),
            self.presence.clone(),
            self.host.clone(),
            connection.clone(),
        )
        .await;
        state = LifecycleState::Active;
        info!(?state, host = %self.host, "client connected");
        counter!(WS_CONNECTIONS_TOTAL).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

        let established = ServerFrame::established(conn_id, account, self.host.clone());
        if let Err(e) = connection.send_frame(&established) {
            warn!(error = %e, "failed to queue connection.established");
        }

        let mut outbound = tokio::spawn(write_loop(writer, rx, connection.clone(), self.config));

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("close requested");
                    break;
                }
                frame = reader.next() => match frame {
                    None => {
                        debug!("stream ended");
                        break;
                    }
                    Some(Err(e)) => {
                        debug!(error = %e, "read error");
                        break;
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("client sent close frame");
                        break;
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => connection.mark_alive(),
                    Some(Ok(Message::Text(_) | Message::Binary(_))) => {
                        connection.mark_alive();
                        debug!("ignoring inbound data frame");
                    }
                },
            }
        }

        state = LifecycleState::Closing;
        debug!(?state, "closing");
        connection.close();
        match tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut outbound).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "writer task ended abnormally"),
            Err(_) => {
                warn!(timeout = ?CLOSE_FLUSH_TIMEOUT, "socket not draining, aborting writer");
                outbound.abort();
            }
        }
        registration.release().await;

        counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
        histogram!(WS_CONNECTION_DURATION_SECONDS).record(connection.age().as_secs_f64());
        state = LifecycleState::Closed;
        info!(?state, dropped = connection.drop_count(), "client disconnected");
        state
    }
}

/// Forward queued frames to the socket and send periodic pings.
///
/// Ends when the connection is closed, the socket rejects a write, or the
/// client stops answering pings; in every case the connection is closed so
/// the read loop ends too.
async fn write_loop<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<Arc<String>>,
    connection: Arc<ClientConnection>,
    config: LifecycleConfig,
) where
    W: Sink<Message> + Unpin + Send,
    W::Error: fmt::Display + Send,
{
    let mut ping_interval = tokio::time::interval(config.heartbeat_interval);
    // Skip the immediate first tick
    let _ = ping_interval.tick().await;

    loop {
        tokio::select! {
            biased;
            () = connection.closed() => break,
            msg = rx.recv() => {
                let Some(text) = msg else { break };
                if let Err(e) = writer.send(Message::Text(String::clone(&text).into())).await {
                    debug!(error = %e, "socket write failed");
                    break;
                }
            }
            _ = ping_interval.tick() => {
                if !connection.check_alive()
                    && connection.last_pong_elapsed() > config.heartbeat_timeout
                {
                    warn!(timeout = ?config.heartbeat_timeout, "client unresponsive, disconnecting");
                    counter!(WS_HEARTBEAT_TIMEOUTS_TOTAL).increment(1);
                    break;
                }
                if writer.send(Message::Ping(Vec::<u8>::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    connection.close();
    let _ = writer.send(Message::Close(None)).await;
    let _ = writer.close().await;
}

/// Registry membership of one connection, plus the presence side effects
/// tied to it.
///
/// [`Registration::release`] is the normal exit. If the guard is dropped
/// without release (the owning task was aborted), the registry entry is
/// removed synchronously and the retract is spawned onto the runtime.
struct Registration {
    registry: Arc<ConnectionRegistry>,
    presence: PresenceDirectory,
    host: HostId,
    connection: Arc<ClientConnection>,
    released: bool,
}

impl Registration {
    /// Register first, then announce if this is the account's first local
    /// connection. A failed announce is logged; delivery stays local-only
    /// until the next lease renewal.
    async fn register(
        registry: Arc<ConnectionRegistry>,
        presence: PresenceDirectory,
        host: HostId,
        connection: Arc<ClientConnection>,
    ) -> Self {
        let account = connection.account().clone();
        let first = registry.add(&account, connection.id().clone(), connection.clone());
        let guard = Self {
            registry,
            presence,
            host,
            connection,
            released: false,
        };
        if first {
            if let Err(e) = guard.presence.announce(&account, &guard.host).await {
                counter!(DIRECTORY_ERRORS_TOTAL, "operation" => "announce").increment(1);
                warn!(%account, error = %e, "announce failed, delivery is local-only");
            }
        }
        guard
    }

    /// Remove the connection, then retract if the account has no local
    /// connections left.
    async fn release(mut self) {
        self.released = true;
        let account = self.connection.account().clone();
        let emptied = self.registry.remove(&account, self.connection.id());
        if emptied {
            retract(&self.registry, &self.presence, &account, &self.host).await;
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.connection.close();
        let account = self.connection.account().clone();
        if !self.registry.remove(&account, self.connection.id()) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(%account, "no runtime, presence retract skipped");
            return;
        };
        let registry = self.registry.clone();
        let presence = self.presence.clone();
        let host = self.host.clone();
        drop(runtime.spawn(async move {
            retract(&registry, &presence, &account, &host).await;
        }));
    }
}

/// Retract `host` for `account`, then re-announce if a new local connection
/// registered while the retract was in flight.
async fn retract(
    registry: &ConnectionRegistry,
    presence: &PresenceDirectory,
    account: &AccountId,
    host: &HostId,
) {
    if let Err(e) = presence.retract(account, host).await {
        counter!(DIRECTORY_ERRORS_TOTAL, "operation" => "retract").increment(1);
        warn!(%account, error = %e, "retract failed, directory keeps a phantom entry");
        return;
    }
    if registry.has(account) {
        debug!(%account, "account reconnected during retract, re-announcing");
        if let Err(e) = presence.announce(account, host).await {
            counter!(DIRECTORY_ERRORS_TOTAL, "operation" => "announce").increment(1);
            warn!(%account, error = %e, "re-announce failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fanout_presence::{MemorySetStore, SetStore, StoreError};
    use futures::channel::mpsc as fmpsc;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// Socket that never accepts a frame.
    struct StuckSink;

    impl Sink<Message> for StuckSink {
        type Error = std::io::Error;

        fn poll_ready(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }

        fn start_send(self: Pin<&mut Self>, _item: Message) -> Result<(), Self::Error> {
            Ok(())
        }

        fn poll_flush(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }

        fn poll_close(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }
    }

    /// Store whose writes always fail.
    struct DownStore;

    #[async_trait]
    impl SetStore for DownStore {
        async fn add(
            &self,
            _key: &str,
            _member: &str,
            _lease: Option<Duration>,
        ) -> fanout_presence::store::Result<()> {
            Err(StoreError::Unavailable("down".into()))
        }

        async fn remove(&self, _key: &str, _member: &str) -> fanout_presence::store::Result<()> {
            Err(StoreError::Unavailable("down".into()))
        }

        async fn members(&self, _key: &str) -> fanout_presence::store::Result<Vec<String>> {
            Err(StoreError::Unavailable("down".into()))
        }

        async fn purge_expired(&self) -> fanout_presence::store::Result<usize> {
            Err(StoreError::Unavailable("down".into()))
        }
    }

    type Inbound = fmpsc::UnboundedSender<Result<Message, axum::Error>>;
    type Outbound = fmpsc::UnboundedReceiver<Message>;

    struct Harness {
        lifecycle: Arc<ConnectionLifecycle>,
        registry: Arc<ConnectionRegistry>,
        presence: PresenceDirectory,
        shutdown: CancellationToken,
    }

    fn harness_with(store: Arc<dyn SetStore>, config: LifecycleConfig) -> Harness {
        let registry = Arc::new(ConnectionRegistry::new());
        let presence = PresenceDirectory::new(store, None);
        let shutdown = CancellationToken::new();
        let lifecycle = Arc::new(ConnectionLifecycle::new(
            "h1:1".into(),
            registry.clone(),
            presence.clone(),
            config,
            shutdown.clone(),
        ));
        Harness {
            lifecycle,
            registry,
            presence,
            shutdown,
        }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(MemorySetStore::new()), LifecycleConfig::default())
    }

    fn open(
        h: &Harness,
        account: &str,
        conn: &str,
    ) -> (Inbound, Outbound, tokio::task::JoinHandle<LifecycleState>) {
        let (in_tx, in_rx) = fmpsc::unbounded();
        let (out_tx, out_rx) = fmpsc::unbounded();
        let lifecycle = h.lifecycle.clone();
        let account = AccountId::from(account);
        let conn = ConnectionId::from(conn);
        let task =
            tokio::spawn(async move { lifecycle.run(in_rx, out_tx, account, conn).await });
        (in_tx, out_rx, task)
    }

    async fn next_text(out: &mut Outbound) -> serde_json::Value {
        loop {
            match out.next().await {
                Some(Message::Text(t)) => return serde_json::from_str(t.as_str()).unwrap(),
                Some(_) => {}
                None => panic!("writer closed"),
            }
        }
    }

    #[test]
    fn handshake_rejects_missing_or_blank_account() {
        assert!(matches!(handshake(None), Err(HandshakeError::MissingAccount)));
        assert!(matches!(handshake(Some("")), Err(HandshakeError::MissingAccount)));
        assert!(matches!(handshake(Some("  ")), Err(HandshakeError::MissingAccount)));
        assert_eq!(handshake(Some("alice")).unwrap().as_str(), "alice");
    }

    #[tokio::test]
    async fn connect_registers_then_announces() {
        let h = harness();
        let (_in, mut out, _task) = open(&h, "alice", "c1");

        let established = next_text(&mut out).await;
        assert_eq!(established["type"], "connection.established");
        assert_eq!(established["data"]["accountId"], "alice");

        assert!(h.registry.has(&"alice".into()));
        let hosts = h.presence.hosts(&"alice".into()).await.unwrap();
        assert!(hosts.contains(&HostId::from("h1:1")));
    }

    #[tokio::test]
    async fn close_frame_removes_and_retracts() {
        let h = harness();
        let (inbound, mut out, task) = open(&h, "alice", "c1");
        let _ = next_text(&mut out).await;

        inbound.unbounded_send(Ok(Message::Close(None))).unwrap();
        assert_eq!(task.await.unwrap(), LifecycleState::Closed);

        assert!(!h.registry.has(&"alice".into()));
        assert!(h.presence.hosts(&"alice".into()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn read_error_closes_connection() {
        let h = harness();
        let (inbound, mut out, task) = open(&h, "alice", "c1");
        let _ = next_text(&mut out).await;

        inbound
            .unbounded_send(Err(axum::Error::new(std::io::Error::other("reset"))))
            .unwrap();
        assert_eq!(task.await.unwrap(), LifecycleState::Closed);
        assert!(h.registry.list(&"alice".into()).is_empty());
    }

    #[tokio::test]
    async fn second_connection_keeps_presence_until_last_closes() {
        let h = harness();
        let (in1, mut out1, t1) = open(&h, "alice", "c1");
        let _ = next_text(&mut out1).await;
        let (in2, mut out2, t2) = open(&h, "alice", "c2");
        let _ = next_text(&mut out2).await;

        drop(in1);
        let _ = t1.await.unwrap();
        assert!(h.registry.has(&"alice".into()));
        assert_eq!(h.presence.hosts(&"alice".into()).await.unwrap().len(), 1);

        drop(in2);
        let _ = t2.await.unwrap();
        assert!(h.presence.hosts(&"alice".into()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn local_close_request_ends_lifecycle() {
        let h = harness();
        let (_in, mut out, task) = open(&h, "alice", "c1");
        let _ = next_text(&mut out).await;

        for conn in h.registry.list(&"alice".into()) {
            conn.close();
        }
        assert_eq!(task.await.unwrap(), LifecycleState::Closed);
        assert!(!h.registry.has(&"alice".into()));
    }

    #[tokio::test]
    async fn shutdown_closes_every_connection() {
        let h = harness();
        let (_a, mut out_a, ta) = open(&h, "alice", "c1");
        let (_b, mut out_b, tb) = open(&h, "bob", "c2");
        let _ = next_text(&mut out_a).await;
        let _ = next_text(&mut out_b).await;

        h.shutdown.cancel();
        let _ = ta.await.unwrap();
        let _ = tb.await.unwrap();
        assert_eq!(h.registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn refuses_connection_after_shutdown() {
        let h = harness();
        h.shutdown.cancel();
        let (_in, _out, task) = open(&h, "alice", "c1");
        assert_eq!(task.await.unwrap(), LifecycleState::Closed);
        assert!(!h.registry.has(&"alice".into()));
    }

    #[tokio::test]
    async fn aborted_task_still_cleans_up() {
        let h = harness();
        let (_in, mut out, task) = open(&h, "alice", "c1");
        let _ = next_text(&mut out).await;

        task.abort();
        let _ = task.await;
        assert!(!h.registry.has(&"alice".into()));

        // The retract is spawned from Drop; give it a few turns.
        for _ in 0..50 {
            if h.presence.hosts(&"alice".into()).await.unwrap().is_empty() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("presence not retracted after abort");
    }

    #[tokio::test(start_paused = true)]
    async fn silent_client_is_reaped_by_heartbeat() {
        let config = LifecycleConfig {
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(3),
            send_buffer: 8,
        };
        let h = harness_with(Arc::new(MemorySetStore::new()), config);
        let (_in, mut out, task) = open(&h, "alice", "c1");
        let _ = next_text(&mut out).await;

        let state = tokio::time::timeout(Duration::from_secs(30), task)
            .await
            .expect("heartbeat should reap the connection")
            .unwrap();
        assert_eq!(state, LifecycleState::Closed);
        assert!(!h.registry.has(&"alice".into()));

        let rest: Vec<Message> = out.collect().await;
        let pings = rest.iter().filter(|m| matches!(m, Message::Ping(_))).count();
        assert!(pings >= 2);
        assert!(matches!(rest.last(), Some(Message::Close(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_socket_does_not_block_cleanup() {
        let h = harness();
        let (inbound, in_rx) = fmpsc::unbounded::<Result<Message, axum::Error>>();
        let lifecycle = h.lifecycle.clone();
        let task = tokio::spawn(async move {
            lifecycle
                .run(in_rx, StuckSink, "alice".into(), "c1".into())
                .await
        });

        for _ in 0..50 {
            if h.registry.has(&"alice".into()) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(h.registry.has(&"alice".into()));

        drop(inbound);
        h.shutdown.cancel();
        let state = tokio::time::timeout(Duration::from_secs(3600), task)
            .await
            .expect("cleanup should not wait on the socket")
            .unwrap();
        assert_eq!(state, LifecycleState::Closed);
        assert!(!h.registry.has(&"alice".into()));
        assert!(h.presence.hosts(&"alice".into()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn announce_failure_keeps_connection_local() {
        let h = harness_with(Arc::new(DownStore), LifecycleConfig::default());
        let (inbound, mut out, task) = open(&h, "alice", "c1");

        let established = next_text(&mut out).await;
        assert_eq!(established["type"], "connection.established");
        assert!(h.registry.has(&"alice".into()));

        drop(inbound);
        assert_eq!(task.await.unwrap(), LifecycleState::Closed);
    }

    #[tokio::test]
    async fn reconnect_during_retract_is_reannounced() {
        let store = Arc::new(MemorySetStore::new());
        let h = harness_with(store.clone(), LifecycleConfig::default());
        let alice = AccountId::from("alice");
        let host = HostId::from("h1:1");

        // A new connection registers after the old one emptied the account
        // but before its retract re-checks.
        let (tx, _rx) = mpsc::channel(1);
        let conn = Arc::new(ClientConnection::new(
            "c2".into(),
            alice.clone(),
            tx,
            CancellationToken::new(),
        ));
        let _ = h.registry.add(&alice, "c2".into(), conn);
        retract(&h.registry, &h.presence, &alice, &host).await;

        assert!(h.presence.hosts(&alice).await.unwrap().contains(&host));
    }
}
