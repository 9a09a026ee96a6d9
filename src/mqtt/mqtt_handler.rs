//! Broker session with statum state machine for connection lifecycle
//!
//! Owns the rumqttc event loop for the whole process. Only this task ever
//! blocks on connecting or on the reconnect delay; message handling happens
//! in the bridge controller on the other end of the inbound channel.
//!
//! # State Machine
//!
//! ```text
//! Disconnected ──connect──► Connecting ──ConnAck──► Connected
//!      ▲                        │                      │
//!      └──────(backoff)─────────┴──────failure─────────┘
//! ```
//!
//! Publishing goes through a cloned [`SessionHandle`]. It checks the state
//! mirrored into a `watch` channel and drops replies while the session is not
//! connected; nothing is queued for later.

use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, ConnectionError, Event, EventLoop, Outgoing,
    Packet, QoS,
};
use statum::{machine, state};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::Backoff;
use super::config::MqttConfig;
use super::message_manager::InboundMessage;

const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

/// Observable connection state, mirrored from the typestate machine
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Transport or authentication failure; always followed by a reconnect
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Broker refused connection: {0:?}")]
    Refused(ConnectReturnCode),

    #[error("Subscribe to {filter} failed: {source}")]
    Subscribe {
        filter: String,
        #[source]
        source: ClientError,
    },

    /// Reply dropped; replies are never retried
    #[error("Publish to {topic} failed: {reason}")]
    PublishFailure { topic: String, reason: String },
}

/// Sink for encoded replies
pub trait ReplyPublisher {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), SessionError>;
}

/// States for the broker connection using statum
#[state]
#[derive(Debug, Clone)]
pub enum SessionState {
    Disconnected, // No transport, waiting to (re)connect
    Connecting,   // Transport opening, waiting for ConnAck
    Connected,    // Subscribed and delivering publishes
}

#[machine]
pub struct BrokerSession<S: SessionState> {
    client: AsyncClient,
    eventloop: EventLoop,
    broker: String,
    filter: String,
    backoff: Backoff,
    status: watch::Sender<ConnectionState>,
    inbound: mpsc::Sender<InboundMessage>,
    shutdown: CancellationToken,
}

pub enum ConnectOutcome {
    Connected(BrokerSession<Connected>),
    Failed(BrokerSession<Disconnected>, SessionError),
    Shutdown,
}

pub enum RunOutcome {
    Dropped(BrokerSession<Disconnected>, SessionError),
    Shutdown,
}

impl<S: SessionState> BrokerSession<S> {
    fn set_state(&self, state: ConnectionState) {
        self.status.send_replace(state);
    }
}

impl BrokerSession<Disconnected> {
    /// Builds the session and the handle used to publish through it. No
    /// network activity happens until [`BrokerSession::connect`].
    pub fn create(
        config: &MqttConfig,
        inbound: mpsc::Sender<InboundMessage>,
        shutdown: CancellationToken,
    ) -> (Self, SessionHandle) {
        info!(
            "Creating broker session for {} as {}",
            config.broker_address(),
            config.client_id
        );

        let (client, eventloop) = AsyncClient::new(config.mqtt_options(), config.channel_capacity);
        let (status, status_rx) = watch::channel(ConnectionState::Disconnected);

        let handle = SessionHandle {
            client: client.clone(),
            status: status_rx,
        };

        let session = Self::new(
            client,
            eventloop,
            config.broker_address(),
            config.subscription_filter.clone(),
            config.backoff.clone(),
            status,
            inbound,
            shutdown,
        );

        (session, handle)
    }

    pub fn connect(self) -> BrokerSession<Connecting> {
        info!("Connecting to broker {}", self.broker);
        self.set_state(ConnectionState::Connecting);
        self.transition()
    }

    /// Sleeps for the next backoff delay. Returns false if shutdown was
    /// requested in the meantime.
    pub async fn wait_before_retry(&mut self) -> bool {
        let delay = self.backoff.next_delay();
        warn!(
            "Reconnecting to {} in {:?} (attempt {})",
            self.broker,
            delay,
            self.backoff.attempt()
        );

        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

impl BrokerSession<Connecting> {
    /// Drives the event loop until the broker acknowledges the connection,
    /// then subscribes to the uplink filter.
    pub async fn await_ack(mut self) -> ConnectOutcome {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.set_state(ConnectionState::Disconnected);
                    return ConnectOutcome::Shutdown;
                }
                event = self.eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Connected to broker {}", self.broker);

                        if let Err(source) = self.client.try_subscribe(self.filter.clone(), QoS::AtMostOnce) {
                            let filter = self.filter.clone();
                            return self.fail(SessionError::Subscribe { filter, source });
                        }
                        info!("Subscribed to {}", self.filter);

                        self.backoff.reset();
                        self.set_state(ConnectionState::Connected);
                        return ConnectOutcome::Connected(self.transition());
                    }
                    Ok(other) => debug!("Event while connecting: {:?}", other),
                    Err(ConnectionError::ConnectionRefused(code)) => {
                        return self.fail(SessionError::Refused(code));
                    }
                    Err(e) => return self.fail(SessionError::Connection(e)),
                }
            }
        }
    }

    fn fail(self, error: SessionError) -> ConnectOutcome {
        error!("Connection to {} failed: {}", self.broker, error);
        self.set_state(ConnectionState::Disconnected);
        ConnectOutcome::Failed(self.transition(), error)
    }
}

impl BrokerSession<Connected> {
    /// Forwards every publish to the controller in arrival order until the
    /// connection drops or shutdown is requested.
    pub async fn run(mut self) -> RunOutcome {
        let mut delivered: u64 = 0;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown requested after {} delivered messages", delivered);
                    self.close().await;
                    return RunOutcome::Shutdown;
                }
                event = self.eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let message = InboundMessage::from_topic(publish.topic.clone(), publish.payload.to_vec());
                        debug!("Received {}", message);

                        if self.inbound.send(message).await.is_err() {
                            warn!("Bridge controller stopped, closing session");
                            self.close().await;
                            return RunOutcome::Shutdown;
                        }
                        delivered += 1;
                    }
                    Ok(Event::Incoming(Packet::SubAck(ack))) => {
                        debug!("Subscription acknowledged: {:?}", ack.return_codes);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Connection to {} dropped: {}", self.broker, e);
                        self.set_state(ConnectionState::Disconnected);
                        return RunOutcome::Dropped(self.transition(), SessionError::Connection(e));
                    }
                }
            }
        }
    }

    // Best-effort DISCONNECT; in-flight replies are not awaited
    async fn close(&mut self) {
        self.set_state(ConnectionState::Disconnected);
        if let Err(e) = self.client.try_disconnect() {
            debug!("Disconnect request not queued: {}", e);
            return;
        }

        let flush = async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        if tokio::time::timeout(DISCONNECT_GRACE, flush).await.is_err() {
            debug!("Disconnect not flushed within {:?}", DISCONNECT_GRACE);
        }
    }
}

/// Runs the session until shutdown, reconnecting forever with backoff.
pub async fn run_session(mut session: BrokerSession<Disconnected>) {
    loop {
        session = match session.connect().await_ack().await {
            ConnectOutcome::Connected(connected) => match connected.run().await {
                RunOutcome::Dropped(disconnected, e) => {
                    debug!("Session dropped: {}", e);
                    disconnected
                }
                RunOutcome::Shutdown => break,
            },
            ConnectOutcome::Failed(disconnected, e) => {
                debug!("Connect attempt failed: {}", e);
                disconnected
            }
            ConnectOutcome::Shutdown => break,
        };

        if !session.wait_before_retry().await {
            break;
        }
    }

    info!("Broker session stopped");
}

/// Cloneable publishing side of the session
#[derive(Clone)]
pub struct SessionHandle {
    client: AsyncClient,
    status: watch::Receiver<ConnectionState>,
}

impl SessionHandle {
    pub fn state(&self) -> ConnectionState {
        *self.status.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.status.clone()
    }
}

impl ReplyPublisher for SessionHandle {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), SessionError> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(SessionError::PublishFailure {
                topic: topic.to_string(),
                reason: format!("session is {:?}", state),
            });
        }

        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload)
            .map_err(|e| SessionError::PublishFailure {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::config::MqttConfig;
    use crate::mqtt::message_manager::inbound_channel;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;

    const WITHIN: Duration = Duration::from_secs(5);
    const UPLINK_TOPIC: &str = "msh/EU_868/2/json/LongFast/!aabbccdd";

    fn config(port: u16, capacity: usize) -> MqttConfig {
        MqttConfig {
            host: "127.0.0.1".to_string(),
            port,
            client_id: "meshtime-test".to_string(),
            credentials: None,
            keep_alive: Duration::from_secs(5),
            channel_capacity: capacity,
            subscription_filter: "msh/+/2/json/+/#".to_string(),
            backoff: Backoff::new(Duration::from_millis(10), Duration::from_millis(40), 2),
        }
    }

    #[tokio::test]
    async fn publish_is_dropped_while_not_connected() {
        let (tx, _rx) = inbound_channel(4);
        let (session, handle) = BrokerSession::create(&config(1883, 4), tx, CancellationToken::new());

        assert_eq!(handle.state(), ConnectionState::Disconnected);
        let result = handle.publish("msh/EU_868/2/json/mqtt", b"{}".to_vec());
        assert!(matches!(result, Err(SessionError::PublishFailure { .. })));

        session.set_state(ConnectionState::Connecting);
        let result = handle.publish("msh/EU_868/2/json/mqtt", b"{}".to_vec());
        assert!(matches!(result, Err(SessionError::PublishFailure { .. })));
    }

    #[tokio::test]
    async fn publish_is_queued_while_connected_until_capacity() {
        let (tx, _rx) = inbound_channel(4);
        let (session, handle) = BrokerSession::create(&config(1883, 2), tx, CancellationToken::new());
        session.set_state(ConnectionState::Connected);

        assert!(handle.publish("msh/EU_868/2/json/mqtt", b"1".to_vec()).is_ok());
        assert!(handle.publish("msh/EU_868/2/json/mqtt", b"2".to_vec()).is_ok());
        assert!(matches!(
            handle.publish("msh/EU_868/2/json/mqtt", b"3".to_vec()),
            Err(SessionError::PublishFailure { .. })
        ));
    }

    #[tokio::test]
    async fn refused_transport_returns_to_disconnected() {
        let (tx, _rx) = inbound_channel(4);
        // Port 1 on loopback refuses connections
        let (session, handle) = BrokerSession::create(&config(1, 4), tx, CancellationToken::new());
        let mut state_rx = handle.subscribe_state();

        let connecting = session.connect();
        assert_eq!(*state_rx.borrow_and_update(), ConnectionState::Connecting);

        match connecting.await_ack().await {
            ConnectOutcome::Failed(_, SessionError::Connection(_)) => {}
            ConnectOutcome::Failed(_, other) => panic!("unexpected error: {other}"),
            _ => panic!("connection to a closed port must fail"),
        }
        assert_eq!(handle.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn retry_delay_grows_and_stops_on_shutdown() {
        let (tx, _rx) = inbound_channel(4);
        let shutdown = CancellationToken::new();
        let (mut session, _handle) = BrokerSession::create(&config(1, 4), tx, shutdown.clone());

        let started = tokio::time::Instant::now();
        assert!(session.wait_before_retry().await);
        assert!(session.wait_before_retry().await);
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(session.backoff.attempt(), 2);

        shutdown.cancel();
        assert!(!session.wait_before_retry().await);
    }

    #[tokio::test]
    async fn run_session_stops_on_shutdown_while_retrying() {
        let (tx, mut rx) = inbound_channel(4);
        let shutdown = CancellationToken::new();
        let (session, handle) = BrokerSession::create(&config(1, 4), tx, shutdown.clone());

        let task = tokio::spawn(run_session(session));
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("session did not stop")
            .unwrap();
        assert_eq!(handle.state(), ConnectionState::Disconnected);
        // Sender dropped with the session
        assert!(rx.recv().await.is_none());
    }

    // Minimal MQTT 3.1.1 broker side: fixed header, then the body
    async fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
        let header = stream.read_u8().await?;
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await?;
            len |= ((byte & 0x7f) as usize) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; len];
        stream.read_exact(&mut body).await?;
        Ok((header >> 4, body))
    }

    fn publish_packet(topic: &str, payload: &[u8]) -> Vec<u8> {
        let remaining = 2 + topic.len() + payload.len();
        assert!(remaining < 128);
        let mut packet = vec![0x30, remaining as u8];
        packet.extend_from_slice(&(topic.len() as u16).to_be_bytes());
        packet.extend_from_slice(topic.as_bytes());
        packet.extend_from_slice(payload);
        packet
    }

    /// Accepts one client, acknowledges CONNECT and SUBSCRIBE, reports the
    /// subscribed filter and pushes one publish.
    async fn serve_client(
        listener: &TcpListener,
        subscribed: &mpsc::UnboundedSender<String>,
        payload: &[u8],
    ) -> TcpStream {
        let (mut stream, _) = listener.accept().await.unwrap();

        let (kind, _) = read_packet(&mut stream).await.unwrap();
        assert_eq!(kind, 1, "expected CONNECT");
        stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();

        let (kind, body) = read_packet(&mut stream).await.unwrap();
        assert_eq!(kind, 8, "expected SUBSCRIBE");
        let filter_len = u16::from_be_bytes([body[2], body[3]]) as usize;
        let filter = String::from_utf8(body[4..4 + filter_len].to_vec()).unwrap();
        subscribed.send(filter).unwrap();
        stream
            .write_all(&[0x90, 0x03, body[0], body[1], 0x00])
            .await
            .unwrap();

        stream
            .write_all(&publish_packet(UPLINK_TOPIC, payload))
            .await
            .unwrap();
        stream
    }

    #[tokio::test]
    async fn dropped_connection_reconnects_and_resubscribes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (subscribed_tx, mut subscribed_rx) = mpsc::unbounded_channel();

        let broker = tokio::spawn(async move {
            let first = serve_client(&listener, &subscribed_tx, b"1").await;
            drop(first);
            let _second = serve_client(&listener, &subscribed_tx, b"2").await;
            std::future::pending::<()>().await;
        });

        let mut cfg = config(port, 4);
        // Long enough to observe the gap between connections
        cfg.backoff = Backoff::new(Duration::from_millis(200), Duration::from_millis(400), 2);
        let (tx, mut rx) = inbound_channel(4);
        let shutdown = CancellationToken::new();
        let (session, handle) = BrokerSession::create(&cfg, tx, shutdown.clone());
        let mut state_rx = handle.subscribe_state();
        let task = tokio::spawn(run_session(session));

        let first = timeout(WITHIN, rx.recv()).await.unwrap().unwrap();
        assert_eq!(first.topic, UPLINK_TOPIC);
        assert_eq!(first.payload, b"1");

        timeout(WITHIN, state_rx.wait_for(|s| *s == ConnectionState::Disconnected))
            .await
            .expect("drop was not observed")
            .unwrap();

        let second = timeout(WITHIN, rx.recv()).await.unwrap().unwrap();
        assert_eq!(second.payload, b"2");
        assert_eq!(handle.state(), ConnectionState::Connected);

        for _ in 0..2 {
            let filter = timeout(WITHIN, subscribed_rx.recv()).await.unwrap().unwrap();
            assert_eq!(filter, "msh/+/2/json/+/#");
        }

        shutdown.cancel();
        timeout(WITHIN, task).await.unwrap().unwrap();
        broker.abort();
    }

    #[tokio::test]
    async fn refused_connack_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let broker = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (kind, _) = read_packet(&mut stream).await.unwrap();
            assert_eq!(kind, 1);
            // Return code 5: not authorized
            stream.write_all(&[0x20, 0x02, 0x00, 0x05]).await.unwrap();
            std::future::pending::<()>().await;
        });

        let (tx, _rx) = inbound_channel(4);
        let (session, handle) = BrokerSession::create(&config(port, 4), tx, CancellationToken::new());

        match timeout(WITHIN, session.connect().await_ack()).await.unwrap() {
            ConnectOutcome::Failed(_, SessionError::Refused(code)) => {
                assert_eq!(code, ConnectReturnCode::NotAuthorized)
            }
            ConnectOutcome::Failed(_, other) => panic!("unexpected error: {other}"),
            _ => panic!("refused CONNACK must fail the attempt"),
        }
        assert_eq!(handle.state(), ConnectionState::Disconnected);
        broker.abort();
    }
}
