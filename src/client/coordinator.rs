//! Connection coordinator
//!
//! Owns the broker handshake, the worker tasks of the live connection and the
//! teardown and reconnect paths. Every caller-facing operation enqueues work
//! and returns a [`Token`] without blocking.
//!
//! Each accepted connection is one *generation*: a writer, reader, dispatcher
//! and optional keepalive task sharing one [`SessionShared`]. A generation is
//! fully stopped before the next one starts, so two generations never touch
//! the same stream.

use super::connection::{
    next_step, protocol_attempts, AttemptOutcome, Backoff, ConnectionState, ConnectionStatus,
    NextStep,
};
use super::keepalive;
use super::message_ids::MessageIds;
use super::net;
use super::payload::Payload;
use super::router::{MessageHandler, Router};
use super::token::{Outcome, Token, TokenKind};
use crate::config::ClientOptions;
use crate::error::{ClientError, ClientResult};
use crate::packet::{
    ConnAck, Connect, ConnectReturnCode, Packet, PacketReader, PacketWriter, ProtocolVersion,
    Publish, QoS, Subscribe, Unsubscribe,
};
use crate::store::{outbound_key, parse_outbound_key, MemoryStore, Store, StoreError};
use crate::transport::{self, BoxedStream, BrokerAddr};
use bytes::Bytes;
use rumqttc::mqttbytes::{valid_filter, valid_topic};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::instrument::WithSubscriber;
use tracing::{debug, info, warn, Dispatch, Instrument};

pub(crate) type StreamReader = PacketReader<ReadHalf<BoxedStream>>;
type StreamWriter = PacketWriter<WriteHalf<BoxedStream>>;

/// How long teardown waits for a worker task before aborting it
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// A packet waiting for the writer, with the token it resolves
pub(crate) struct Outbound {
    pub packet: Packet,
    pub token: Option<Token>,
}

/// Bounded outbound queues, shared by every generation
///
/// The control queue carries acknowledgements and DISCONNECT and is always
/// drained ahead of the general queue.
pub(crate) struct Queues {
    pub control_tx: mpsc::Sender<Outbound>,
    pub general_tx: mpsc::Sender<Outbound>,
    pub control_rx: Mutex<mpsc::Receiver<Outbound>>,
    pub general_rx: Mutex<mpsc::Receiver<Outbound>>,
}

impl Queues {
    fn new(depth: usize) -> Self {
        let (control_tx, control_rx) = mpsc::channel(depth);
        let (general_tx, general_rx) = mpsc::channel(depth);
        Self {
            control_tx,
            general_tx,
            control_rx: Mutex::new(control_rx),
            general_rx: Mutex::new(general_rx),
        }
    }

    /// Resolve every queued operation with `reason`; the writer must be stopped
    async fn drain(&self, reason: impl Fn() -> ClientError) {
        let mut drained = 0usize;
        for queue in [&self.control_rx, &self.general_rx] {
            let mut queue = queue.lock().await;
            while let Ok(item) = queue.try_recv() {
                if let Some(token) = item.token {
                    token.resolve_err(reason());
                }
                drained += 1;
            }
        }
        if drained > 0 {
            debug!(count = drained, "Discarded queued packets");
        }
    }
}

/// State shared by the worker tasks of one generation
pub(crate) struct SessionShared {
    pub generation: u64,
    stop: watch::Sender<bool>,
    pub writer: Mutex<StreamWriter>,
    pub ping_outstanding: AtomicBool,
    /// Token of the packet being written that resolves on write rather than
    /// on an acknowledgement; failed by teardown if the write never finishes
    in_hand: std::sync::Mutex<Option<Token>>,
}

impl SessionShared {
    pub(crate) fn new(generation: u64, writer: StreamWriter) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            generation,
            stop,
            writer: Mutex::new(writer),
            ping_outstanding: AtomicBool::new(false),
            in_hand: std::sync::Mutex::new(None),
        }
    }

    pub(crate) fn hold(&self, token: Token) {
        *self.in_hand.lock().unwrap_or_else(|e| e.into_inner()) = Some(token);
    }

    pub(crate) fn release(&self) -> Option<Token> {
        self.in_hand.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Fire the stop signal; true only for the first caller
    fn signal_stop(&self) -> bool {
        self.stop.send_if_modified(|stopped| {
            if *stopped {
                false
            } else {
                *stopped = true;
                true
            }
        })
    }

    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }
}

/// Resolve once `stop` reads true or its sender is gone
pub(crate) async fn wait_stopped(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}

struct Session {
    shared: Arc<SessionShared>,
    tasks: Vec<JoinHandle<()>>,
}

/// An accepted handshake, not yet running
struct Established {
    broker: BrokerAddr,
    version: ProtocolVersion,
    connack: ConnAck,
    reader: StreamReader,
    writer: StreamWriter,
}

pub(crate) struct ClientInner {
    options: ClientOptions,
    brokers: Vec<BrokerAddr>,
    pub status: ConnectionStatus,
    pub ids: MessageIds,
    pub router: Router,
    pub store: Arc<dyn Store>,
    pub queues: Queues,
    session: Mutex<Option<Session>>,
    generation: AtomicU64,
    /// Bumped by every connect and disconnect; a handshake started under an
    /// older epoch must not bring up a session
    connect_epoch: AtomicU64,
    /// Set by disconnect, cleared by connect; stops handshakes and the reconnect loop
    user_stop: watch::Sender<bool>,
    dispatch: Dispatch,
}

impl ClientInner {
    fn spawn<F>(&self, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(future.with_subscriber(self.dispatch.clone()))
    }

    fn user_stopped(&self) -> bool {
        *self.user_stop.borrow()
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.connect_epoch.load(Ordering::SeqCst) == epoch
    }

    /// Report a fatal transport or liveness failure from a worker task
    ///
    /// Only the first report per generation is acted on.
    pub(crate) fn connection_lost(self: &Arc<Self>, shared: &SessionShared, error: ClientError) {
        if !shared.signal_stop() {
            debug!(generation = shared.generation, error = %error, "Generation already stopping");
            return;
        }
        warn!(generation = shared.generation, error = %error, "Connection lost");
        let inner = self.clone();
        let generation = shared.generation;
        self.spawn(async move { inner.handle_connection_lost(generation, error).await });
    }

    async fn handle_connection_lost(self: Arc<Self>, generation: u64, error: ClientError) {
        let mut slot = self.session.lock().await;
        if !slot
            .as_ref()
            .is_some_and(|session| session.shared.generation == generation)
        {
            debug!(generation, "Ignoring connection loss of a finished generation");
            return;
        }
        if let Some(session) = slot.take() {
            stop_session(session).await;
        }
        let epoch = self.connect_epoch.load(Ordering::SeqCst);

        let auto_reconnect = self.options.auto_reconnect;
        let next = if auto_reconnect {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Disconnected
        };
        if !self.status.transition(ConnectionState::Connected, next) {
            // A user disconnect got here first and owns the rest of teardown
            return;
        }
        drop(slot);

        let reason = error.to_string();
        if let Some(callback) = self.options.on_connection_lost.clone() {
            let client = Client::from_inner(self.clone());
            self.spawn(async move { callback(&client, &error) });
        }

        if auto_reconnect {
            info!("Starting reconnect loop");
            let inner = self.clone();
            self.spawn(async move { inner.reconnect(epoch).await });
        } else {
            self.ids
                .clean_up(|| ClientError::connection_lost(reason.clone()));
            self.queues
                .drain(|| ClientError::connection_lost(reason.clone()))
                .await;
            info!("Connection lost and auto-reconnect disabled, client disconnected");
        }
    }

    async fn run_connect(self: Arc<Self>, token: Token, epoch: u64) {
        let established = match self.connect_brokers(epoch).await {
            Ok(established) => established,
            Err(error) => {
                if self.is_current(epoch) {
                    self.status
                        .transition(ConnectionState::Connecting, ConnectionState::Disconnected);
                }
                warn!(error = %error, "Connect failed");
                let return_code = error.return_code();
                token.resolve(Outcome {
                    return_code,
                    ..Outcome::failed(error)
                });
                return;
            }
        };

        let return_code = established.connack.return_code;
        let session_present = established.connack.session_present;
        match self
            .start_session(established, ConnectionState::Connecting, epoch)
            .await
        {
            Ok(()) => {
                token.resolve(Outcome {
                    return_code: Some(return_code),
                    session_present,
                    ..Outcome::ok()
                });
            }
            Err(error) => {
                if self.is_current(epoch) {
                    self.status
                        .transition(ConnectionState::Connecting, ConnectionState::Disconnected);
                }
                warn!(error = %error, "Session setup failed");
                token.resolve_err(error);
            }
        }
    }

    /// One pass over the broker list, with protocol fallback per broker
    ///
    /// A broker rejection is reported in preference to a network failure.
    async fn connect_brokers(&self, epoch: u64) -> ClientResult<Established> {
        let attempts = protocol_attempts(self.options.protocol_version, self.options.protocol_pinned);
        let mut rejection = None;
        let mut unreachable = None;

        for broker in &self.brokers {
            for (index, version) in attempts.iter().copied().enumerate() {
                if self.user_stopped() || !self.is_current(epoch) {
                    return Err(ClientError::NotConnected);
                }
                debug!(broker = %broker, protocol = version.protocol_name(), level = version.level(), "Connect attempt");
                let error = match self.attempt(broker, version).await {
                    Ok(established) => return Ok(established),
                    Err(error) => error,
                };
                warn!(broker = %broker, level = version.level(), error = %error, "Connect attempt failed");

                let outcome = if error.is_rejection() {
                    rejection = Some(error);
                    AttemptOutcome::Rejected
                } else {
                    unreachable = Some(error);
                    AttemptOutcome::Unreachable
                };
                if next_step(outcome, index + 1 < attempts.len()) != NextStep::NextVersion {
                    break;
                }
            }
        }

        Err(rejection.or(unreachable).unwrap_or(ClientError::NotConnected))
    }

    async fn attempt(&self, broker: &BrokerAddr, version: ProtocolVersion) -> ClientResult<Established> {
        let timeout = self.options.connect_timeout;
        let stream = transport::dial(broker, self.options.tls.as_ref(), timeout).await?;
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = PacketReader::new(read_half);
        let mut writer = PacketWriter::new(write_half);
        let network_error = |message: String| ClientError::NetworkError {
            broker: broker.to_string(),
            message,
        };

        writer
            .write_packet(&Packet::Connect(self.connect_packet(version)))
            .await
            .map_err(|e| network_error(format!("CONNECT write failed: {e}")))?;

        let reply = match tokio::time::timeout(timeout, reader.read_packet()).await {
            Ok(Ok(packet)) => packet,
            Ok(Err(e)) => return Err(network_error(format!("CONNACK read failed: {e}"))),
            Err(_) => {
                return Err(ClientError::ConnectTimeout {
                    broker: broker.to_string(),
                })
            }
        };
        let connack = match reply {
            Packet::ConnAck(connack) => connack,
            other => {
                let _ = writer.shutdown().await;
                return Err(network_error(format!("expected CONNACK, got {}", other.name())));
            }
        };
        if connack.return_code != ConnectReturnCode::Accepted {
            let _ = writer.shutdown().await;
            return Err(ClientError::ConnectionRefused {
                broker: broker.to_string(),
                code: connack.return_code,
            });
        }

        Ok(Established {
            broker: broker.clone(),
            version,
            connack,
            reader,
            writer,
        })
    }

    fn connect_packet(&self, protocol: ProtocolVersion) -> Connect {
        Connect {
            protocol,
            client_id: self.options.client_id.clone(),
            keep_alive: self.options.keep_alive_secs(),
            clean_session: self.options.clean_session,
            will: self.options.will.clone(),
            username: self.options.username.clone(),
            password: self.options.password.clone().map(Bytes::from),
        }
    }

    /// Bring up a new generation on an accepted handshake
    ///
    /// Fails with [`ClientError::NotConnected`] when the state is no longer
    /// `from` or `epoch` is stale, which happens when the user disconnects
    /// mid-handshake, possibly followed by a new connect.
    async fn start_session(
        self: &Arc<Self>,
        established: Established,
        from: ConnectionState,
        epoch: u64,
    ) -> ClientResult<()> {
        let Established {
            broker,
            version,
            connack,
            reader,
            mut writer,
        } = established;
        let mut slot = self.session.lock().await;

        if self.status.state() != from || self.user_stopped() || !self.is_current(epoch) {
            let _ = writer.shutdown().await;
            return Err(ClientError::NotConnected);
        }
        self.status.touch();
        if let Err(error) = self.prepare_store(&mut writer).await {
            let _ = writer.shutdown().await;
            return Err(error);
        }
        if !self.status.transition(from, ConnectionState::Connected) {
            let _ = writer.shutdown().await;
            return Err(ClientError::NotConnected);
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let shared = Arc::new(SessionShared::new(generation, writer));
        let (message_tx, message_rx) = mpsc::channel(self.options.message_channel_depth);

        let span = crate::session_span!(generation, broker = %broker);
        let mut tasks = Vec::with_capacity(4);
        tasks.push(self.spawn(net::run_writer(self.clone(), shared.clone()).instrument(span.clone())));
        tasks.push(self.spawn(
            net::run_dispatcher(self.clone(), shared.clone(), message_rx).instrument(span.clone()),
        ));
        let keep_alive = self.options.keep_alive_secs();
        if keep_alive > 0 {
            let monitor = keepalive::run(
                self.clone(),
                shared.clone(),
                Duration::from_secs(u64::from(keep_alive)),
            );
            tasks.push(self.spawn(monitor.instrument(span.clone())));
        }

        info!(
            broker = %broker,
            level = version.level(),
            session_present = connack.session_present,
            generation,
            "Connected"
        );
        if let Some(callback) = self.options.on_connect.clone() {
            let client = Client::from_inner(self.clone());
            self.spawn(async move { callback(&client) });
        }

        // Last, so nothing inbound is handled before the session is in place
        tasks.push(self.spawn(
            net::run_reader(self.clone(), shared.clone(), reader, message_tx).instrument(span),
        ));
        *slot = Some(Session { shared, tasks });
        Ok(())
    }

    async fn prepare_store(&self, writer: &mut StreamWriter) -> ClientResult<()> {
        self.store.open()?;
        if self.options.clean_session {
            self.ids
                .clean_up(|| ClientError::connection_lost("session discarded by clean connect"));
            self.store.reset()?;
            Ok(())
        } else {
            self.resume(writer).await
        }
    }

    /// Resend stored outbound packets in message-id order
    ///
    /// Runs before the writer task starts, so replayed packets go out ahead
    /// of anything queued since.
    async fn resume(&self, writer: &mut StreamWriter) -> ClientResult<()> {
        let mut pending: Vec<u16> = self
            .store
            .all()?
            .iter()
            .filter_map(|key| parse_outbound_key(key))
            .collect();
        pending.sort_unstable();

        for id in pending {
            let key = outbound_key(id);
            let mut packet = match self.store.get(&key) {
                Ok(Some(packet)) => packet,
                Ok(None) => continue,
                Err(error @ StoreError::Corrupt { .. }) => {
                    warn!(key = %key, error = %error, "Dropping unreadable stored packet");
                    self.store.del(&key)?;
                    continue;
                }
                Err(error) => return Err(error.into()),
            };
            if let Packet::Publish(publish) = &mut packet {
                publish.dup = true;
            }
            let token = self
                .ids
                .lookup(id)
                .unwrap_or_else(|| Token::new(resumed_kind(&packet)));
            self.ids.claim(id, token);

            writer
                .write_packet(&packet)
                .await
                .map_err(|e| ClientError::connection_lost(format!("resend failed: {e}")))?;
            debug!(message_id = id, packet = packet.name(), "Resent in-flight packet");
        }
        Ok(())
    }

    async fn reconnect(self: Arc<Self>, epoch: u64) {
        let mut backoff = Backoff::new(self.options.max_reconnect_interval);
        let mut stop = self.user_stop.subscribe();

        loop {
            if self.status.state() != ConnectionState::Reconnecting || !self.is_current(epoch) {
                return;
            }
            match self.connect_brokers(epoch).await {
                Ok(established) => match self
                    .start_session(established, ConnectionState::Reconnecting, epoch)
                    .await
                {
                    Ok(()) => {
                        info!("Reconnected");
                        return;
                    }
                    Err(error) => warn!(error = %error, "Session setup failed after reconnect"),
                },
                Err(error) => warn!(error = %error, "Reconnect cycle failed"),
            }

            let delay = backoff.next_delay();
            debug!(delay_ms = delay.as_millis() as u64, "Waiting before next reconnect cycle");
            tokio::select! {
                _ = wait_stopped(&mut stop) => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Final teardown shared by disconnect and forced disconnect
    async fn shutdown(&self) {
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            stop_session(session).await;
        }
        self.router.close();
        self.ids.clean_up(|| ClientError::NotConnected);
        self.queues.drain(|| ClientError::NotConnected).await;
        self.store.close();
        info!("Disconnected");
    }
}

fn resumed_kind(packet: &Packet) -> TokenKind {
    match packet {
        Packet::Subscribe(subscribe) => TokenKind::Subscribe {
            filters: subscribe.filters.clone(),
        },
        Packet::Unsubscribe(unsubscribe) => TokenKind::Unsubscribe {
            filters: unsubscribe.filters.clone(),
        },
        _ => TokenKind::Publish,
    }
}

/// Stop one generation and wait for its tasks
async fn stop_session(session: Session) {
    let Session { shared, tasks } = session;
    shared.signal_stop();

    for task in tasks {
        let abort = task.abort_handle();
        match tokio::time::timeout(SHUTDOWN_GRACE, task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if !e.is_cancelled() => {
                warn!(generation = shared.generation, "Worker task failed: {}", e);
            }
            Ok(Err(_)) => {}
            Err(_) => {
                warn!(generation = shared.generation, "Worker task did not stop in time, aborting");
                abort.abort();
            }
        }
    }

    if let Some(token) = shared.release() {
        debug!(generation = shared.generation, "Failing token of an unfinished write");
        token.resolve_err(ClientError::connection_lost(
            "connection closed before the packet was written",
        ));
    }

    let closed = tokio::time::timeout(SHUTDOWN_GRACE, async {
        shared.writer.lock().await.shutdown().await
    })
    .await;
    if !matches!(closed, Ok(Ok(()))) {
        debug!(generation = shared.generation, "Stream did not shut down cleanly");
    }
    debug!(generation = shared.generation, "Generation stopped");
}

/// Handle to an MQTT client
///
/// Cloning is cheap and every clone drives the same connection. Operations
/// spawn onto the current tokio runtime, so they must be called from within
/// one.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("client_id", &self.inner.options.client_id)
            .field("state", &self.inner.status.state())
            .field("in_flight", &self.inner.ids.in_use())
            .finish()
    }
}

impl Client {
    /// Build a client; nothing touches the network until [`Client::connect`]
    ///
    /// Logs go to the dispatcher current at this call unless
    /// [`ClientOptions::with_log_dispatch`] set one.
    pub fn new(mut options: ClientOptions) -> ClientResult<Self> {
        options.validate()?;
        let brokers = options
            .brokers
            .iter()
            .map(|raw| BrokerAddr::parse(raw))
            .collect::<ClientResult<Vec<_>>>()?;
        if options.client_id.is_empty() {
            options.client_id = generate_client_id();
        }

        let store: Arc<dyn Store> = match options.store.clone() {
            Some(store) => store,
            None => Arc::new(MemoryStore::new()),
        };
        let router = Router::new();
        router.set_default_handler(options.default_handler.clone());
        let dispatch = options
            .log_dispatch
            .clone()
            .unwrap_or_else(|| tracing::dispatcher::get_default(|current| current.clone()));
        let (user_stop, _) = watch::channel(false);

        debug!(client_id = %options.client_id, brokers = brokers.len(), "Client created");
        Ok(Self {
            inner: Arc::new(ClientInner {
                queues: Queues::new(options.message_channel_depth),
                options,
                brokers,
                status: ConnectionStatus::new(),
                ids: MessageIds::new(),
                router,
                store,
                session: Mutex::new(None),
                generation: AtomicU64::new(0),
                connect_epoch: AtomicU64::new(0),
                user_stop,
                dispatch,
            }),
        })
    }

    pub(crate) fn from_inner(inner: Arc<ClientInner>) -> Self {
        Self { inner }
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<ClientInner> {
        &self.inner
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.status.state()
    }

    /// Whether operations are accepted, which includes while reconnecting
    pub fn is_connected(&self) -> bool {
        self.inner.status.state().accepts_operations()
    }

    /// Operations waiting for a broker acknowledgement
    pub fn in_flight(&self) -> usize {
        self.inner.ids.in_use()
    }

    /// Filters that currently have a registered handler
    pub fn routes(&self) -> Vec<String> {
        self.inner.router.filters()
    }

    /// Start connecting in the background
    ///
    /// The token resolves once the first accepted broker is fully set up, or
    /// with the most telling error once every broker has been tried.
    pub fn connect(&self) -> Token {
        let token = Token::new(TokenKind::Connect);
        if !self
            .inner
            .status
            .transition(ConnectionState::Disconnected, ConnectionState::Connecting)
        {
            token.resolve_err(ClientError::AlreadyConnected);
            return token;
        }
        let epoch = self.inner.connect_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.user_stop.send_replace(false);
        self.inner.router.reopen();

        let inner = self.inner.clone();
        let resolver = token.clone();
        self.inner
            .spawn(async move { inner.run_connect(resolver, epoch).await });
        token
    }

    /// Send DISCONNECT, wait up to `quiesce` for it to be written, then tear down
    pub async fn disconnect(&self, quiesce: Duration) {
        let previous = self.inner.status.set_state(ConnectionState::Disconnected);
        if previous == ConnectionState::Disconnected {
            warn!("Disconnect called while already disconnected");
            return;
        }
        self.inner.connect_epoch.fetch_add(1, Ordering::SeqCst);
        info!(quiesce_ms = quiesce.as_millis() as u64, "Disconnecting");
        self.inner.user_stop.send_replace(true);

        if previous == ConnectionState::Connected {
            let token = Token::new(TokenKind::Disconnect);
            let outbound = Outbound {
                packet: Packet::Disconnect,
                token: Some(token.clone()),
            };
            match self.inner.queues.control_tx.try_send(outbound) {
                Ok(()) => {
                    if !token.wait_timeout(quiesce).await {
                        debug!("DISCONNECT not written within the quiesce period");
                    }
                }
                Err(_) => debug!("Control queue unavailable, skipping DISCONNECT"),
            }
        }
        self.inner.shutdown().await;
    }

    /// Tear down without sending DISCONNECT, so the broker publishes the will
    pub async fn force_disconnect(&self) {
        let previous = self.inner.status.set_state(ConnectionState::Disconnected);
        if previous == ConnectionState::Disconnected {
            warn!("Forced disconnect while already disconnected");
            return;
        }
        self.inner.connect_epoch.fetch_add(1, Ordering::SeqCst);
        warn!("Forcing disconnect");
        self.inner.user_stop.send_replace(true);
        self.inner.shutdown().await;
    }

    /// Queue a publication
    ///
    /// QoS 0 tokens resolve once written; QoS 1 and 2 tokens resolve on
    /// PUBACK and PUBCOMP.
    pub fn publish(&self, topic: &str, qos: QoS, retain: bool, payload: impl Into<Payload>) -> Token {
        if !self.is_connected() {
            return Token::failed(TokenKind::Publish, ClientError::NotConnected);
        }
        if topic.is_empty() || !valid_topic(topic) {
            return Token::failed(TokenKind::Publish, ClientError::invalid_topic(topic));
        }
        let payload = match payload.into().into_bytes() {
            Ok(payload) => payload,
            Err(error) => return Token::failed(TokenKind::Publish, error),
        };

        let packet = Packet::Publish(Publish::new(topic, qos, retain, payload));
        self.enqueue(packet, Token::new(TokenKind::Publish))
    }

    pub fn subscribe(&self, filter: &str, qos: QoS, handler: Option<MessageHandler>) -> Token {
        self.subscribe_multiple(&[(filter, qos)], handler)
    }

    /// Subscribe to several filters in one SUBSCRIBE
    ///
    /// `handler` is routed for every filter before the request is queued.
    pub fn subscribe_multiple(&self, filters: &[(&str, QoS)], handler: Option<MessageHandler>) -> Token {
        let requested: Vec<(String, QoS)> = filters
            .iter()
            .map(|(filter, qos)| (filter.to_string(), *qos))
            .collect();
        let kind = TokenKind::Subscribe {
            filters: requested.clone(),
        };
        if !self.is_connected() {
            return Token::failed(kind, ClientError::NotConnected);
        }
        if requested.is_empty() {
            return Token::failed(kind, ClientError::invalid_topic(""));
        }
        if let Some((bad, _)) = requested
            .iter()
            .find(|(filter, _)| filter.is_empty() || !valid_filter(filter))
        {
            let error = ClientError::invalid_topic(bad.as_str());
            return Token::failed(kind, error);
        }

        if let Some(handler) = handler {
            for (filter, _) in &requested {
                self.inner.router.add_route(filter, handler.clone());
            }
        }
        let packet = Packet::Subscribe(Subscribe {
            message_id: 0,
            filters: requested,
        });
        self.enqueue(packet, Token::new(kind))
    }

    /// Queue an UNSUBSCRIBE, then drop the routes for `filters`
    pub fn unsubscribe(&self, filters: &[&str]) -> Token {
        let filters: Vec<String> = filters.iter().map(|f| f.to_string()).collect();
        let kind = TokenKind::Unsubscribe {
            filters: filters.clone(),
        };
        if !self.is_connected() {
            return Token::failed(kind, ClientError::NotConnected);
        }
        if filters.is_empty() {
            return Token::failed(kind, ClientError::invalid_topic(""));
        }
        if let Some(bad) = filters.iter().find(|f| f.is_empty() || !valid_filter(f)) {
            let error = ClientError::invalid_topic(bad.as_str());
            return Token::failed(kind, error);
        }

        let packet = Packet::Unsubscribe(Unsubscribe {
            message_id: 0,
            filters: filters.clone(),
        });
        let token = self.enqueue(packet, Token::new(kind));
        if !token.is_complete() {
            for filter in &filters {
                self.inner.router.delete_route(filter);
            }
        }
        token
    }

    fn enqueue(&self, packet: Packet, token: Token) -> Token {
        let outbound = Outbound {
            packet,
            token: Some(token.clone()),
        };
        match self.inner.queues.general_tx.try_send(outbound) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("Outbound queue full");
                token.resolve_err(ClientError::QueueFull);
            }
            Err(TrySendError::Closed(_)) => {
                token.resolve_err(ClientError::NotConnected);
            }
        }
        token
    }
}

/// Client id for options that leave it empty, short enough for MQTT 3.1
fn generate_client_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("mqttlink-{}", &id[..12])
}
