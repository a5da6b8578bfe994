use std::sync::Arc;
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS,
    SubscribeReasonCode,
};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{BrokerAddress, MqttConfig};
use crate::error::SyncError;
use crate::telemetry::{TelemetrySnapshot, TelemetryState};

use super::OutboundMessage;
use super::topics::{TopicBindings, led_payload};

const OUTBOUND_CAPACITY: usize = 64;
const REQUEST_CAPACITY: usize = 100;
const SUBSCRIBE_QOS: QoS = QoS::AtMostOnce;

/// Session lifecycle. Inbound messages are only applied in `Subscribed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Disconnected,
    Connecting,
    Subscribed,
}

/// Result of a local LED toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToggleOutcome {
    pub index: usize,
    /// The new local value, applied regardless of `queued`.
    pub on: bool,
    /// Whether the command made it onto the outbound queue.
    pub queued: bool,
}

/// State shared between the synchronizer handle and its network worker.
struct Shared {
    bindings: TopicBindings,
    state: TelemetryState,
    phase: watch::Sender<SyncPhase>,
}

impl Shared {
    fn set_phase(&self, phase: SyncPhase) {
        self.phase.send_if_modified(|current| {
            if *current == phase {
                return false;
            }
            debug!("Synchronizer phase {:?} -> {:?}", *current, phase);
            *current = phase;
            true
        });
    }

    fn on_message(&self, topic: &str, payload: &[u8]) -> Option<TelemetrySnapshot> {
        if *self.phase.borrow() != SyncPhase::Subscribed {
            // Known limitation: nothing is buffered during the connect race.
            debug!("Dropping message on {} received before subscription completed", topic);
            return None;
        }
        match self.bindings.decode(topic, payload) {
            Ok(Some(update)) => self.state.apply(update),
            Ok(None) => {
                debug!("Ignoring message on unbound topic {}", topic);
                None
            }
            Err(e) => {
                warn!("{}; keeping previous snapshot", e);
                None
            }
        }
    }
}

struct Session {
    cancel: CancellationToken,
    worker: JoinHandle<()>,
}

/// Keeps a [`TelemetryState`] in sync with the device over MQTT and turns
/// local LED toggles into outbound commands.
pub struct StateSynchronizer {
    config: MqttConfig,
    shared: Arc<Shared>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    outbound_rx: Arc<Mutex<mpsc::Receiver<OutboundMessage>>>,
    session: Mutex<Option<Session>>,
    stopped: CancellationToken,
}

impl StateSynchronizer {
    pub fn new(config: &MqttConfig, bindings: TopicBindings, state: TelemetryState) -> Self {
        let (phase, _) = watch::channel(SyncPhase::Disconnected);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        Self {
            config: config.clone(),
            shared: Arc::new(Shared {
                bindings,
                state,
                phase,
            }),
            outbound_tx,
            outbound_rx: Arc::new(Mutex::new(outbound_rx)),
            session: Mutex::new(None),
            stopped: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> &TelemetryState {
        &self.shared.state
    }

    pub fn bindings(&self) -> &TopicBindings {
        &self.shared.bindings
    }

    pub fn phase(&self) -> SyncPhase {
        *self.shared.phase.borrow()
    }

    pub fn phase_changes(&self) -> watch::Receiver<SyncPhase> {
        self.shared.phase.subscribe()
    }

    /// Establish the broker session and subscribe to every bound topic.
    ///
    /// Returns once the broker has acknowledged the connection; the phase
    /// moves to `Subscribed` when the SUBACK arrives on the worker. A
    /// `Connection` error leaves the synchronizer `Disconnected` and may be
    /// retried.
    pub async fn connect(
        &self,
        broker: &BrokerAddress,
        keep_alive: Duration,
    ) -> Result<(), SyncError> {
        if self.stopped.is_cancelled() {
            return Err(SyncError::Stopped);
        }
        // Zero disables keep-alive; anything else is whole seconds on the wire.
        if !keep_alive.is_zero() && keep_alive < Duration::from_secs(1) {
            return Err(SyncError::connection(
                broker.to_string(),
                format!("keep-alive {keep_alive:?} is below one second"),
            ));
        }
        let mut session = self.session.lock().await;
        if session.is_some() {
            return Err(SyncError::AlreadyConnected);
        }

        self.shared.set_phase(SyncPhase::Connecting);
        info!("Connecting to MQTT broker {}", broker);

        let mut mqttopts = MqttOptions::new(&self.config.client_id, &broker.host, broker.port);
        mqttopts.set_keep_alive(keep_alive);
        if let (Some(user), Some(pass)) = (&self.config.username, &self.config.password) {
            mqttopts.set_credentials(user, pass);
        }
        let (client, mut eventloop) = AsyncClient::new(mqttopts, REQUEST_CAPACITY);

        let handshake = tokio::select! {
            _ = self.stopped.cancelled() => Err("stopped during connect".to_string()),
            res = tokio::time::timeout(self.config.connect_timeout, wait_for_connack(&mut eventloop)) => {
                res.unwrap_or_else(|_| Err(format!("no CONNACK within {:?}", self.config.connect_timeout)))
            }
        };
        if let Err(reason) = handshake {
            self.shared.set_phase(SyncPhase::Disconnected);
            return Err(SyncError::connection(broker.to_string(), reason));
        }

        info!("Connected to MQTT broker {}", broker);
        self.shared.state.set_connected(true);

        if let Err(e) = client
            .subscribe_many(self.shared.bindings.subscriptions(SUBSCRIBE_QOS))
            .await
        {
            self.shared.state.set_connected(false);
            self.shared.set_phase(SyncPhase::Disconnected);
            return Err(SyncError::connection(broker.to_string(), e));
        }

        let cancel = self.stopped.child_token();
        let worker = SyncWorker {
            client,
            eventloop,
            shared: self.shared.clone(),
            outbound: self.outbound_rx.clone(),
            cancel: cancel.clone(),
            reconnect_delay: self.config.reconnect_delay,
        };
        *session = Some(Session {
            cancel,
            worker: tokio::spawn(worker.run()),
        });
        Ok(())
    }

    /// Retry [`connect`](Self::connect) with exponential backoff until it
    /// succeeds or the synchronizer is stopped.
    pub async fn connect_with_backoff(
        &self,
        broker: &BrokerAddress,
        keep_alive: Duration,
    ) -> Result<(), SyncError> {
        let mut backoff = self.config.reconnect_delay;
        let max_backoff = Duration::from_secs(60);

        loop {
            match self.connect(broker, keep_alive).await {
                Ok(()) | Err(SyncError::AlreadyConnected) => return Ok(()),
                Err(SyncError::Stopped) => return Err(SyncError::Stopped),
                Err(e) => {
                    error!("{}. Retrying in {:?}", e, backoff);
                    tokio::select! {
                        _ = self.stopped.cancelled() => return Err(SyncError::Stopped),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(max_backoff);
                }
            }
        }
    }

    /// Entry point for every inbound message. Returns the new snapshot when
    /// the message changed state.
    pub fn on_message(&self, topic: &str, payload: &[u8]) -> Option<TelemetrySnapshot> {
        self.shared.on_message(topic, payload)
    }

    /// Flip LED `index` locally and queue the new value for the device.
    ///
    /// The local flip is never rolled back; if the command cannot be queued
    /// the next status echo from the device restores consistency.
    pub fn toggle(&self, index: usize) -> Result<ToggleOutcome, SyncError> {
        let topic = self
            .shared
            .bindings
            .led_topic(index)
            .ok_or(SyncError::InvalidLedIndex(index))?;

        // Queue inside the state update so concurrent toggles on one slot
        // reach the broker in the same order they were applied locally.
        let (on, queued) = self.shared.state.toggle_led_and(index, |on| {
            let msg = OutboundMessage {
                topic: topic.to_string(),
                payload: led_payload(on).to_string(),
            };
            match self.outbound_tx.try_send(msg) {
                Ok(()) => true,
                Err(e) => {
                    warn!("LED {} set to {} locally but not queued: {}", index + 1, on, e);
                    false
                }
            }
        })?;

        Ok(ToggleOutcome { index, on, queued })
    }

    /// Release the current session, if any. The synchronizer can connect
    /// again afterwards.
    pub async fn disconnect(&self) {
        let Some(session) = self.session.lock().await.take() else {
            return;
        };
        session.cancel.cancel();
        if let Err(e) = session.worker.await {
            error!("MQTT worker ended abnormally: {}", e);
        }
    }

    /// Disconnect and refuse any further connection attempts.
    pub async fn stop(&self) {
        self.stopped.cancel();
        self.disconnect().await;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }
}

impl Drop for StateSynchronizer {
    fn drop(&mut self) {
        // The worker closes the socket itself once cancelled.
        self.stopped.cancel();
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), String> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(format!("broker refused connection: {:?}", ack.code))
                };
            }
            Ok(_) => {}
            Err(e) => return Err(e.to_string()),
        }
    }
}

/// Drives the rumqttc event loop for one session: applies inbound
/// messages, publishes queued commands and re-subscribes after the
/// transport reconnects.
struct SyncWorker {
    client: AsyncClient,
    eventloop: EventLoop,
    shared: Arc<Shared>,
    outbound: Arc<Mutex<mpsc::Receiver<OutboundMessage>>>,
    cancel: CancellationToken,
    reconnect_delay: Duration,
}

impl SyncWorker {
    async fn run(mut self) {
        let outbound = self.outbound.clone();
        let mut outbound = outbound.lock().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = self.eventloop.poll() => {
                    match event {
                        Ok(Event::Incoming(incoming)) => self.handle_incoming(incoming),
                        Ok(Event::Outgoing(_)) => {}
                        Err(e) => {
                            error!(
                                "MQTT connection error: {}. Reconnecting in {:?}",
                                e, self.reconnect_delay
                            );
                            self.shared.state.set_connected(false);
                            self.shared.set_phase(SyncPhase::Connecting);
                            tokio::select! {
                                _ = self.cancel.cancelled() => break,
                                _ = tokio::time::sleep(self.reconnect_delay) => {}
                            }
                        }
                    }
                }
                Some(msg) = outbound.recv() => {
                    debug!("Publishing {}: {}", msg.topic, msg.payload);
                    if let Err(e) = self.client.try_publish(
                        &msg.topic,
                        QoS::AtMostOnce,
                        false,
                        msg.payload.into_bytes(),
                    ) {
                        warn!("Failed to publish {}: {}", msg.topic, e);
                    }
                }
            }
        }

        drop(outbound);
        self.shutdown().await;
    }

    fn handle_incoming(&self, incoming: Incoming) {
        match incoming {
            Incoming::ConnAck(_) => {
                info!("Reconnected to MQTT broker, re-subscribing");
                self.shared.state.set_connected(true);
                if let Err(e) = self
                    .client
                    .try_subscribe_many(self.shared.bindings.subscriptions(SUBSCRIBE_QOS))
                {
                    error!("Failed to re-subscribe: {}", e);
                }
            }
            Incoming::SubAck(ack) => {
                let rejected = ack
                    .return_codes
                    .iter()
                    .filter(|c| matches!(c, SubscribeReasonCode::Failure))
                    .count();
                let total = ack.return_codes.len();
                if rejected == total {
                    error!("Broker rejected all {} subscriptions", total);
                    return;
                }
                if rejected > 0 {
                    warn!("Broker rejected {} of {} subscriptions", rejected, total);
                }
                info!("Subscribed to {} topics", total - rejected);
                self.shared.set_phase(SyncPhase::Subscribed);
            }
            Incoming::Publish(publish) => {
                if let Some(snap) = self.shared.on_message(&publish.topic, &publish.payload) {
                    debug!("Applied {} (revision {})", publish.topic, snap.revision);
                }
            }
            Incoming::Disconnect => {
                warn!("Broker closed the session");
                self.shared.state.set_connected(false);
                self.shared.set_phase(SyncPhase::Connecting);
            }
            _ => {}
        }
    }

    async fn shutdown(mut self) {
        if let Err(e) = self.client.try_disconnect() {
            debug!("Disconnect request not queued: {}", e);
        }
        let flush = async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        let _ = tokio::time::timeout(Duration::from_secs(1), flush).await;
        drop(self.eventloop);

        self.shared.state.set_connected(false);
        self.shared.set_phase(SyncPhase::Disconnected);
        info!("Disconnected from MQTT broker");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::topics::RelaySentinels;
    use crate::telemetry::LED_COUNT;
    use rumqttc::SubAck;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const CONNECT: u8 = 1;
    const PUBLISH: u8 = 3;
    const SUBSCRIBE: u8 = 8;
    const PINGREQ: u8 = 12;
    const DISCONNECT: u8 = 14;

    fn test_config() -> MqttConfig {
        MqttConfig {
            broker: BrokerAddress {
                host: "127.0.0.1".into(),
                port: 1883,
            },
            username: None,
            password: None,
            client_id: "dashlink-test".into(),
            keep_alive: Duration::from_secs(60),
            connect_timeout: Duration::from_millis(500),
            reconnect_delay: Duration::from_millis(100),
            topic_prefix: "arduino".into(),
        }
    }

    fn synchronizer() -> StateSynchronizer {
        StateSynchronizer::new(
            &test_config(),
            TopicBindings::new("arduino", RelaySentinels::default(), 1.0),
            TelemetryState::new(),
        )
    }

    /// A worker that never touches the network, for feeding packets to
    /// `handle_incoming` directly.
    fn offline_worker(sync: &StateSynchronizer) -> SyncWorker {
        let (client, eventloop) =
            AsyncClient::new(MqttOptions::new("dashlink-test", "127.0.0.1", 1883), 10);
        SyncWorker {
            client,
            eventloop,
            shared: sync.shared.clone(),
            outbound: sync.outbound_rx.clone(),
            cancel: CancellationToken::new(),
            reconnect_delay: Duration::from_millis(100),
        }
    }

    fn packet(first_byte: u8, body: &[u8]) -> Vec<u8> {
        let mut out = vec![first_byte];
        let mut len = body.len();
        loop {
            let mut byte = (len % 128) as u8;
            len /= 128;
            if len > 0 {
                byte |= 0x80;
            }
            out.push(byte);
            if len == 0 {
                break;
            }
        }
        out.extend_from_slice(body);
        out
    }

    fn connack() -> Vec<u8> {
        packet(0x20, &[0x00, 0x00])
    }

    fn suback(pkid: u16, codes: &[u8]) -> Vec<u8> {
        let mut body = pkid.to_be_bytes().to_vec();
        body.extend_from_slice(codes);
        packet(0x90, &body)
    }

    fn publish(topic: &str, payload: &[u8]) -> Vec<u8> {
        let mut body = (topic.len() as u16).to_be_bytes().to_vec();
        body.extend_from_slice(topic.as_bytes());
        body.extend_from_slice(payload);
        packet(0x30, &body)
    }

    async fn read_packet(socket: &mut TcpStream) -> (u8, Vec<u8>) {
        let first = socket.read_u8().await.unwrap();
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let byte = socket.read_u8().await.unwrap();
            len |= usize::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; len];
        socket.read_exact(&mut body).await.unwrap();
        (first >> 4, body)
    }

    /// Next packet from the client other than a PINGREQ, which must be of
    /// type `kind`.
    async fn expect_packet(socket: &mut TcpStream, kind: u8) -> Vec<u8> {
        loop {
            let (got, body) = tokio::time::timeout(Duration::from_secs(5), read_packet(socket))
                .await
                .expect("client packet in time");
            if got == PINGREQ {
                continue;
            }
            assert_eq!(got, kind, "unexpected packet type");
            return body;
        }
    }

    fn parse_subscribe(body: &[u8]) -> (u16, Vec<String>) {
        let pkid = u16::from_be_bytes([body[0], body[1]]);
        let mut topics = Vec::new();
        let mut rest = &body[2..];
        while rest.len() >= 2 {
            let len = usize::from(u16::from_be_bytes([rest[0], rest[1]]));
            topics.push(String::from_utf8(rest[2..2 + len].to_vec()).unwrap());
            // Skip the requested QoS byte.
            rest = &rest[2 + len + 1..];
        }
        (pkid, topics)
    }

    fn parse_publish(body: &[u8]) -> (String, Vec<u8>) {
        let len = usize::from(u16::from_be_bytes([body[0], body[1]]));
        let topic = String::from_utf8(body[2..2 + len].to_vec()).unwrap();
        (topic, body[2 + len..].to_vec())
    }

    /// Accept one client connection and complete the MQTT handshake.
    async fn accept_session(listener: &TcpListener) -> TcpStream {
        let (mut socket, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .expect("client connects in time")
            .unwrap();
        expect_packet(&mut socket, CONNECT).await;
        socket.write_all(&connack()).await.unwrap();
        socket
    }

    /// Grant every filter in the client's next SUBSCRIBE.
    async fn grant_subscribe(socket: &mut TcpStream) -> Vec<String> {
        let body = expect_packet(socket, SUBSCRIBE).await;
        let (pkid, topics) = parse_subscribe(&body);
        socket
            .write_all(&suback(pkid, &vec![0x00; topics.len()]))
            .await
            .unwrap();
        topics
    }

    async fn wait_for_phase(rx: &mut watch::Receiver<SyncPhase>, phase: SyncPhase) {
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|p| *p == phase))
            .await
            .expect("phase change in time")
            .expect("synchronizer alive");
    }

    fn subscribed() -> StateSynchronizer {
        let sync = synchronizer();
        sync.shared.set_phase(SyncPhase::Subscribed);
        sync
    }

    #[test]
    fn starts_disconnected() {
        let sync = synchronizer();
        assert_eq!(sync.phase(), SyncPhase::Disconnected);
        assert!(!sync.state().is_connected());
    }

    #[test]
    fn messages_before_subscription_are_dropped() {
        let sync = synchronizer();
        assert!(sync.on_message("arduino/output", b"ON").is_none());
        sync.shared.set_phase(SyncPhase::Connecting);
        assert!(sync.on_message("arduino/output", b"ON").is_none());
        assert!(!sync.state().snapshot().relay);
    }

    #[test]
    fn applies_structured_sensor_payload() {
        let sync = subscribed();
        sync.on_message("arduino/output", b"ON");
        let snap = sync
            .on_message("arduino/input", br#"{"temp": 23.4, "humi": 55.0, "pot": 512}"#)
            .unwrap();
        assert_eq!(snap.temperature, 23.4);
        assert_eq!(snap.humidity, 55.0);
        assert_eq!(snap.potentiometer, 512);
        assert!(snap.relay, "relay must be untouched when absent");
    }

    #[test]
    fn malformed_payload_keeps_state_and_processing_continues() {
        let sync = subscribed();
        sync.on_message(
            "arduino/input",
            br#"{"temp": 20.0, "humi": 30.0, "pot": 7, "relay": true}"#,
        );
        let before = sync.state().snapshot();

        assert!(sync.on_message("arduino/input", b"{\"temp\": 99.0,").is_none());
        assert_eq!(sync.state().snapshot(), before);

        assert!(sync.on_message("arduino/led2", b"1").is_some());
        assert_eq!(sync.state().led(1), Some(true));
    }

    #[test]
    fn relay_sentinels_drive_relay_flag() {
        let sync = subscribed();
        sync.on_message("arduino/output", b"ON");
        assert!(sync.state().snapshot().relay);
        sync.on_message("arduino/output", b"oFF");
        assert!(!sync.state().snapshot().relay);
        sync.on_message("arduino/output", b"post 3200 on");
        assert!(sync.state().snapshot().relay);
    }

    #[test]
    fn unknown_topic_is_ignored() {
        let sync = subscribed();
        let before = sync.state().snapshot();
        assert!(sync.on_message("arduino/new-sensor", b"{}").is_none());
        assert_eq!(sync.state().snapshot(), before);
    }

    #[tokio::test]
    async fn toggle_flips_locally_and_queues_command() {
        let sync = synchronizer();

        let first = sync.toggle(2).unwrap();
        assert_eq!(
            first,
            ToggleOutcome {
                index: 2,
                on: true,
                queued: true
            }
        );
        let second = sync.toggle(2).unwrap();
        assert!(!second.on);

        let mut rx = sync.outbound_rx.lock().await;
        assert_eq!(
            rx.try_recv().unwrap(),
            OutboundMessage {
                topic: "arduino/led3".into(),
                payload: "1".into()
            }
        );
        assert_eq!(rx.try_recv().unwrap().payload, "0");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn toggle_is_not_rolled_back_when_queue_is_full() {
        let sync = synchronizer();
        let total = OUTBOUND_CAPACITY + 5;
        let mut queued = 0;
        for _ in 0..total {
            if sync.toggle(0).unwrap().queued {
                queued += 1;
            }
        }
        assert_eq!(queued, OUTBOUND_CAPACITY);
        assert_eq!(sync.state().led(0), Some(total % 2 == 1));
    }

    #[test]
    fn toggle_rejects_out_of_range_index() {
        let sync = synchronizer();
        assert!(matches!(
            sync.toggle(LED_COUNT),
            Err(SyncError::InvalidLedIndex(8))
        ));
    }

    #[tokio::test]
    async fn connect_to_closed_port_is_a_connection_error() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let sync = synchronizer();
        let broker = BrokerAddress {
            host: "127.0.0.1".into(),
            port,
        };
        let err = sync
            .connect(&broker, Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Connection { .. }), "{err}");
        assert_eq!(sync.phase(), SyncPhase::Disconnected);
        assert!(!sync.state().is_connected());
    }

    #[tokio::test]
    async fn connect_times_out_when_broker_never_answers() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let broker = BrokerAddress {
            host: "127.0.0.1".into(),
            port: listener.local_addr().unwrap().port(),
        };
        let sync = synchronizer();
        let err = sync
            .connect(&broker, Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Connection { .. }));
        assert_eq!(sync.phase(), SyncPhase::Disconnected);
    }

    #[tokio::test]
    async fn no_connect_after_stop() {
        let sync = synchronizer();
        sync.stop().await;
        let broker = test_config().broker;
        assert!(matches!(
            sync.connect(&broker, Duration::from_secs(30)).await,
            Err(SyncError::Stopped)
        ));
        assert!(matches!(
            sync.connect_with_backoff(&broker, Duration::from_secs(30)).await,
            Err(SyncError::Stopped)
        ));
    }

    #[tokio::test]
    async fn sub_second_keep_alive_is_a_connection_error() {
        let sync = synchronizer();
        let err = sync
            .connect(&test_config().broker, Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Connection { .. }), "{err}");
        assert_eq!(sync.phase(), SyncPhase::Disconnected);
    }

    #[tokio::test]
    async fn suback_rejecting_every_topic_is_not_subscribed() {
        let sync = synchronizer();
        sync.shared.set_phase(SyncPhase::Connecting);
        let worker = offline_worker(&sync);

        worker.handle_incoming(Incoming::SubAck(SubAck::new(
            1,
            vec![SubscribeReasonCode::Failure; 2 + LED_COUNT],
        )));
        assert_eq!(sync.phase(), SyncPhase::Connecting);
        assert!(sync.on_message("arduino/output", b"ON").is_none());

        let mut codes = vec![SubscribeReasonCode::Success(QoS::AtMostOnce); 2 + LED_COUNT];
        codes[0] = SubscribeReasonCode::Failure;
        worker.handle_incoming(Incoming::SubAck(SubAck::new(2, codes)));
        assert_eq!(sync.phase(), SyncPhase::Subscribed);
    }

    #[tokio::test]
    async fn broker_session_syncs_state_publishes_toggles_and_resubscribes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let broker = BrokerAddress {
            host: "127.0.0.1".into(),
            port: listener.local_addr().unwrap().port(),
        };
        let sync = synchronizer();
        let mut phases = sync.phase_changes();
        let mut snapshots = sync.state().subscribe();

        let (connected, mut socket) = tokio::join!(
            sync.connect(&broker, Duration::from_secs(30)),
            accept_session(&listener)
        );
        connected.unwrap();
        assert!(sync.state().is_connected());

        let topics = grant_subscribe(&mut socket).await;
        assert_eq!(topics.len(), 2 + LED_COUNT);
        assert!(topics.iter().any(|t| t == sync.bindings().sensor_topic()));
        assert!(topics.iter().any(|t| t == sync.bindings().relay_topic()));
        assert!(topics.iter().any(|t| t == "arduino/led8"));
        wait_for_phase(&mut phases, SyncPhase::Subscribed).await;

        socket
            .write_all(&publish("arduino/output", b"POST 3200 ON"))
            .await
            .unwrap();
        socket
            .write_all(&publish(
                "arduino/input",
                br#"{"temp": 21.5, "humi": 40.0, "pot": 300}"#,
            ))
            .await
            .unwrap();
        socket.write_all(&publish("arduino/led4", b"1")).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), snapshots.wait_for(|s| s.leds[3]))
            .await
            .unwrap()
            .unwrap();
        let snap = sync.state().snapshot();
        assert!(snap.relay);
        assert_eq!(snap.temperature, 21.5);
        assert_eq!(snap.humidity, 40.0);
        assert_eq!(snap.potentiometer, 300);

        let outcome = sync.toggle(3).unwrap();
        assert!(!outcome.on);
        assert!(outcome.queued);
        let (topic, payload) = parse_publish(&expect_packet(&mut socket, PUBLISH).await);
        assert_eq!(Some(topic.as_str()), sync.bindings().led_topic(3));
        assert_eq!(payload, b"0");

        // Broker drops the connection; the worker reconnects on its own.
        drop(socket);
        wait_for_phase(&mut phases, SyncPhase::Connecting).await;
        assert!(!sync.state().is_connected());

        let mut socket = accept_session(&listener).await;
        let topics = grant_subscribe(&mut socket).await;
        assert_eq!(topics.len(), 2 + LED_COUNT);
        wait_for_phase(&mut phases, SyncPhase::Subscribed).await;
        assert!(sync.state().is_connected());

        socket.write_all(&publish("arduino/led4", b"1")).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), snapshots.wait_for(|s| s.leds[3]))
            .await
            .unwrap()
            .unwrap();

        sync.stop().await;
        assert_eq!(sync.phase(), SyncPhase::Disconnected);
        assert!(!sync.state().is_connected());
        expect_packet(&mut socket, DISCONNECT).await;
    }

    #[tokio::test]
    async fn disconnect_without_session_is_a_no_op() {
        let sync = synchronizer();
        sync.disconnect().await;
        assert_eq!(sync.phase(), SyncPhase::Disconnected);
    }
}
