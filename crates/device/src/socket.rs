use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};
use tracing::{debug, error, info, warn};

use crate::error::{DeviceError, DeviceResult};
use crate::types::{ConnectionState, ControlToken};

const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Everything that can happen to the real-time channel, in arrival order.
///
/// Each channel instance gets a new generation; events from an older
/// generation are stale and get dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Opened { generation: u64 },
    Frame { generation: u64, text: String },
    Closed { generation: u64 },
    Error { generation: u64, error: String },
    ReconnectTick,
}

/// What the owner of the manager has to act on after an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionOutput {
    Connected,
    Disconnected,
    Frame(String),
}

/// Write half of an open (or opening) channel.
pub struct ChannelHandle {
    outbound: mpsc::UnboundedSender<String>,
    task: Option<JoinHandle<()>>,
}

impl ChannelHandle {
    pub fn new(outbound: mpsc::UnboundedSender<String>, task: Option<JoinHandle<()>>) -> Self {
        Self { outbound, task }
    }

    fn send(&self, text: &str) -> DeviceResult<()> {
        self.outbound
            .send(text.to_string())
            .map_err(|_| DeviceError::Transport("channel writer has stopped".to_string()))
    }

    /// Dropping the write half lets the task send a Close frame. Anything
    /// still running after the grace period is aborted.
    fn shutdown(self) {
        let Self { outbound, task } = self;
        drop(outbound);
        let Some(mut task) = task else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if timeout(CLOSE_GRACE, &mut task).await.is_err() {
                        debug!("Channel task did not finish closing, aborting");
                        task.abort();
                    }
                });
            }
            Err(_) => task.abort(),
        }
    }
}

/// Opens real-time channels. The connector must report the outcome through
/// `events`: `Opened` once usable, then `Frame`s, then exactly one of `Closed`
/// or `Error`.
pub trait Connector: Send + 'static {
    fn open(
        &self,
        url: &str,
        generation: u64,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> ChannelHandle;
}

pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl Connector for WsConnector {
    fn open(
        &self,
        url: &str,
        generation: u64,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> ChannelHandle {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let url = url.to_string();
        let connect_timeout = self.connect_timeout;

        let task = tokio::spawn(async move {
            let event =
                match run_channel(&url, connect_timeout, generation, &events, outbound_rx).await {
                    Ok(()) => ChannelEvent::Closed { generation },
                    Err(e) => ChannelEvent::Error {
                        generation,
                        error: e.to_string(),
                    },
                };
            let _ = events.send(event);
        });

        ChannelHandle::new(outbound_tx, Some(task))
    }
}

async fn run_channel(
    url: &str,
    connect_timeout: Duration,
    generation: u64,
    events: &mpsc::UnboundedSender<ChannelEvent>,
    mut outbound: mpsc::UnboundedReceiver<String>,
) -> DeviceResult<()> {
    let (ws_stream, _) = timeout(connect_timeout, connect_async(url))
        .await
        .map_err(|_| DeviceError::Transport(format!("connecting to {url} timed out")))?
        .map_err(|e| DeviceError::Transport(e.to_string()))?;
    info!("WebSocket connected");
    let _ = events.send(ChannelEvent::Opened { generation });

    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            frame = read.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    debug!("Received: {}", text.as_str());
                    let _ = events.send(ChannelEvent::Frame {
                        generation,
                        text: text.as_str().to_owned(),
                    });
                }
                Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => {
                        let _ = events.send(ChannelEvent::Frame { generation, text });
                    }
                    Err(_) => warn!("Dropping non UTF-8 binary frame"),
                },
                Some(Ok(WsMessage::Close(_))) => {
                    info!("WebSocket closed by device");
                    return Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(DeviceError::Transport(e.to_string())),
                None => {
                    info!("WebSocket stream ended");
                    return Ok(());
                }
            },
            text = outbound.recv() => match text {
                Some(text) => {
                    debug!("Sending: {}", text);
                    write
                        .send(WsMessage::Text(text.into()))
                        .await
                        .map_err(|e| DeviceError::Transport(e.to_string()))?;
                }
                None => {
                    let _ = write.send(WsMessage::Close(None)).await;
                    return Ok(());
                }
            }
        }
    }
}

/// Owns the single real-time channel to the local device and its reconnect
/// timer.
pub struct ConnectionManager<C: Connector> {
    connector: C,
    url: String,
    reconnect_interval: Duration,
    state: ConnectionState,
    generation: u64,
    channel: Option<ChannelHandle>,
    reconnect_timer: Option<JoinHandle<()>>,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    last_frame_at: Option<DateTime<Utc>>,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(
        connector: C,
        url: impl Into<String>,
        reconnect_interval: Duration,
        events_tx: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Self {
        Self {
            connector,
            url: url.into(),
            reconnect_interval,
            state: ConnectionState::Disconnected,
            generation: 0,
            channel: None,
            reconnect_timer: None,
            events_tx,
            last_frame_at: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_timer.is_some()
    }

    pub fn last_frame_at(&self) -> Option<DateTime<Utc>> {
        self.last_frame_at
    }

    #[cfg(test)]
    pub(crate) fn generation_for_tests(&self) -> u64 {
        self.generation
    }

    pub fn connect(&mut self) {
        if self.state != ConnectionState::Disconnected {
            debug!(state = ?self.state, "Connect ignored, channel already live or pending");
            return;
        }

        self.generation += 1;
        info!(url = %self.url, generation = self.generation, "Connecting to device");
        self.state = ConnectionState::Connecting;
        let handle = self
            .connector
            .open(&self.url, self.generation, self.events_tx.clone());
        self.channel = Some(handle);
    }

    pub fn handle_event(&mut self, event: ChannelEvent) -> Option<ConnectionOutput> {
        match event {
            // A tick queued before the timer was cancelled must not reopen.
            ChannelEvent::ReconnectTick if self.reconnect_timer.is_some() => {
                self.connect();
                None
            }
            ChannelEvent::Opened { generation } if self.is_current(generation) => self.on_open(),
            ChannelEvent::Frame { generation, text } if self.is_current(generation) => {
                self.last_frame_at = Some(Utc::now());
                Some(ConnectionOutput::Frame(text))
            }
            ChannelEvent::Closed { generation } if self.is_current(generation) => self.on_closed(),
            ChannelEvent::Error { generation, error } if self.is_current(generation) => {
                warn!("WebSocket error: {}", error);
                self.on_closed()
            }
            stale => {
                debug!(?stale, "Ignoring event from a retired channel");
                None
            }
        }
    }

    /// Sends `status_request` when connected; otherwise does nothing.
    pub fn request_status(&self) {
        if let Err(e) = self.send_control(ControlToken::StatusRequest) {
            debug!("Status request skipped: {}", e);
        }
    }

    pub fn send_control(&self, token: ControlToken) -> DeviceResult<()> {
        match (&self.channel, self.state) {
            (Some(channel), ConnectionState::Connected) => channel.send(token.as_str()),
            _ => Err(DeviceError::NotConnected),
        }
    }

    /// Drops the channel and the reconnect timer without scheduling recovery.
    pub fn close(&mut self) {
        self.cancel_reconnect();
        if let Some(channel) = self.channel.take() {
            channel.shutdown();
        }
        if self.state != ConnectionState::Disconnected {
            info!("Connection closed");
        }
        self.state = ConnectionState::Disconnected;
    }

    pub fn dispose(mut self) {
        self.close();
    }

    fn is_current(&self, generation: u64) -> bool {
        self.channel.is_some() && generation == self.generation
    }

    fn on_open(&mut self) -> Option<ConnectionOutput> {
        info!("WebSocket connection opened");
        self.state = ConnectionState::Connected;
        self.cancel_reconnect();
        self.request_status();
        Some(ConnectionOutput::Connected)
    }

    fn on_closed(&mut self) -> Option<ConnectionOutput> {
        if let Some(channel) = self.channel.take() {
            channel.shutdown();
        }
        let was_connected = self.state == ConnectionState::Connected;
        self.state = ConnectionState::Disconnected;
        info!("WebSocket connection closed, reconnecting in {:?}", self.reconnect_interval);
        self.schedule_reconnect();
        was_connected.then_some(ConnectionOutput::Disconnected)
    }

    fn schedule_reconnect(&mut self) {
        if self.reconnect_timer.is_some() {
            return;
        }
        let tx = self.events_tx.clone();
        let period = self.reconnect_interval;
        self.reconnect_timer = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if tx.send(ChannelEvent::ReconnectTick).is_err() {
                    error!("Reconnect timer has no listener, stopping");
                    break;
                }
            }
        }));
    }

    fn cancel_reconnect(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            debug!("Reconnect timer cancelled");
            timer.abort();
        }
    }
}

impl<C: Connector> Drop for ConnectionManager<C> {
    fn drop(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
        if let Some(channel) = self.channel.take() {
            channel.shutdown();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    #[derive(Default)]
    pub(crate) struct FakeChannelState {
        pub opens: usize,
        pub fail: bool,
        pub outbound: Vec<mpsc::UnboundedReceiver<String>>,
    }

    /// Opens instantly (or fails instantly) and keeps every written frame.
    #[derive(Clone, Default)]
    pub(crate) struct FakeConnector {
        pub state: Arc<Mutex<FakeChannelState>>,
    }

    impl FakeConnector {
        pub fn failing() -> Self {
            let connector = Self::default();
            connector.set_fail(true);
            connector
        }

        pub fn set_fail(&self, fail: bool) {
            self.state.lock().unwrap().fail = fail;
        }

        pub fn opens(&self) -> usize {
            self.state.lock().unwrap().opens
        }

        /// Drains frames written to the most recent channel.
        pub fn sent(&self) -> Vec<String> {
            let mut state = self.state.lock().unwrap();
            let mut frames = Vec::new();
            if let Some(rx) = state.outbound.last_mut() {
                while let Ok(frame) = rx.try_recv() {
                    frames.push(frame);
                }
            }
            frames
        }
    }

    impl Connector for FakeConnector {
        fn open(
            &self,
            _url: &str,
            generation: u64,
            events: mpsc::UnboundedSender<ChannelEvent>,
        ) -> ChannelHandle {
            let mut state = self.state.lock().unwrap();
            state.opens += 1;
            let (tx, rx) = mpsc::unbounded_channel();
            state.outbound.push(rx);
            let event = if state.fail {
                ChannelEvent::Error {
                    generation,
                    error: "connection refused".to_string(),
                }
            } else {
                ChannelEvent::Opened { generation }
            };
            let _ = events.send(event);
            ChannelHandle::new(tx, None)
        }
    }

    fn manager(
        connector: FakeConnector,
    ) -> (
        ConnectionManager<FakeConnector>,
        mpsc::UnboundedReceiver<ChannelEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ConnectionManager::new(connector, "ws://horus.test:81/", Duration::from_secs(5), tx),
            rx,
        )
    }

    fn pump(
        manager: &mut ConnectionManager<FakeConnector>,
        rx: &mut mpsc::UnboundedReceiver<ChannelEvent>,
    ) -> Vec<ConnectionOutput> {
        let mut outputs = Vec::new();
        while let Ok(event) = rx.try_recv() {
            outputs.extend(manager.handle_event(event));
        }
        outputs
    }

    #[tokio::test]
    async fn open_sends_status_request() {
        let connector = FakeConnector::default();
        let (mut manager, mut rx) = manager(connector.clone());

        manager.connect();
        assert_eq!(manager.state(), ConnectionState::Connecting);
        let outputs = pump(&mut manager, &mut rx);

        assert_eq!(outputs, vec![ConnectionOutput::Connected]);
        assert!(manager.is_connected());
        assert_eq!(connector.sent(), vec!["status_request".to_string()]);
    }

    #[tokio::test]
    async fn second_connect_is_a_no_op() {
        let connector = FakeConnector::default();
        let (mut manager, mut rx) = manager(connector.clone());

        manager.connect();
        manager.connect();
        pump(&mut manager, &mut rx);
        manager.connect();

        assert_eq!(connector.opens(), 1);
    }

    #[tokio::test]
    async fn request_status_is_silent_when_disconnected() {
        let connector = FakeConnector::default();
        let (manager, _rx) = manager(connector.clone());

        manager.request_status();
        assert!(matches!(
            manager.send_control(ControlToken::OtaCheckRequest),
            Err(DeviceError::NotConnected)
        ));
        assert_eq!(connector.opens(), 0);
    }

    #[tokio::test]
    async fn frames_are_routed_and_stale_ones_dropped() {
        let connector = FakeConnector::default();
        let (mut manager, mut rx) = manager(connector.clone());
        manager.connect();
        pump(&mut manager, &mut rx);

        let out = manager.handle_event(ChannelEvent::Frame {
            generation: 1,
            text: "{\"tpd\":3}".to_string(),
        });
        assert_eq!(out, Some(ConnectionOutput::Frame("{\"tpd\":3}".to_string())));
        assert!(manager.last_frame_at().is_some());

        let stale = manager.handle_event(ChannelEvent::Frame {
            generation: 0,
            text: "{}".to_string(),
        });
        assert_eq!(stale, None);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_attempts_share_one_reconnect_timer() {
        let connector = FakeConnector::failing();
        let (mut manager, mut rx) = manager(connector.clone());

        manager.connect();
        assert!(pump(&mut manager, &mut rx).is_empty());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.reconnect_pending());

        for attempt in 1..=3 {
            let tick = rx.recv().await.unwrap();
            assert_eq!(tick, ChannelEvent::ReconnectTick);
            manager.handle_event(tick);
            pump(&mut manager, &mut rx);
            assert_eq!(connector.opens(), 1 + attempt);
            assert!(manager.reconnect_pending());
        }

        connector.set_fail(false);
        let tick = rx.recv().await.unwrap();
        manager.handle_event(tick);
        let outputs = pump(&mut manager, &mut rx);

        assert_eq!(outputs, vec![ConnectionOutput::Connected]);
        assert!(!manager.reconnect_pending());
        assert_eq!(connector.opens(), 5);

        tokio::time::advance(Duration::from_secs(30)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn error_then_close_schedules_recovery_once() {
        let connector = FakeConnector::default();
        let (mut manager, mut rx) = manager(connector.clone());
        manager.connect();
        pump(&mut manager, &mut rx);

        let out = manager.handle_event(ChannelEvent::Error {
            generation: 1,
            error: "reset".to_string(),
        });
        assert_eq!(out, Some(ConnectionOutput::Disconnected));
        assert_eq!(manager.handle_event(ChannelEvent::Closed { generation: 1 }), None);
        assert!(manager.reconnect_pending());

        let tick = rx.recv().await.unwrap();
        manager.handle_event(tick);
        pump(&mut manager, &mut rx);
        assert!(manager.is_connected());
        assert_eq!(connector.opens(), 2);
        assert_eq!(connector.sent(), vec!["status_request".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn close_cancels_recovery() {
        let connector = FakeConnector::failing();
        let (mut manager, mut rx) = manager(connector.clone());
        manager.connect();
        pump(&mut manager, &mut rx);
        assert!(manager.reconnect_pending());

        manager.close();
        assert!(!manager.reconnect_pending());
        assert_eq!(manager.handle_event(ChannelEvent::ReconnectTick), None);

        tokio::time::advance(Duration::from_secs(20)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
        assert_eq!(connector.opens(), 1);
    }

    async fn local_listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/", listener.local_addr().unwrap());
        (listener, url)
    }

    async fn next_output(
        manager: &mut ConnectionManager<WsConnector>,
        rx: &mut mpsc::UnboundedReceiver<ChannelEvent>,
    ) -> ConnectionOutput {
        loop {
            let event = timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if let Some(output) = manager.handle_event(event) {
                return output;
            }
        }
    }

    #[tokio::test]
    async fn websocket_channel_requests_status_and_reads_frames() {
        let (listener, url) = local_listener().await;
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let request = ws.next().await.unwrap().unwrap();
            ws.send(WsMessage::text(r#"{"tpd":5}"#.to_string()))
                .await
                .unwrap();
            ws.send(WsMessage::binary(br#"{"duration":30}"#.to_vec()))
                .await
                .unwrap();
            ws.close(None).await.unwrap();
            request
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut manager = ConnectionManager::new(
            WsConnector::new(Duration::from_secs(5)),
            url,
            Duration::from_secs(5),
            tx,
        );
        manager.connect();

        assert_eq!(next_output(&mut manager, &mut rx).await, ConnectionOutput::Connected);
        assert_eq!(
            next_output(&mut manager, &mut rx).await,
            ConnectionOutput::Frame(r#"{"tpd":5}"#.to_string())
        );
        assert_eq!(
            next_output(&mut manager, &mut rx).await,
            ConnectionOutput::Frame(r#"{"duration":30}"#.to_string())
        );
        assert_eq!(
            next_output(&mut manager, &mut rx).await,
            ConnectionOutput::Disconnected
        );
        assert!(manager.reconnect_pending());

        let request = server.await.unwrap();
        assert_eq!(request, WsMessage::text("status_request".to_string()));
    }

    #[tokio::test]
    async fn stalled_handshake_times_out_as_error() {
        let (listener, url) = local_listener().await;
        let _server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stream);
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = WsConnector::new(Duration::from_millis(200)).open(&url, 7, tx);

        let event = timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            event,
            ChannelEvent::Error { generation: 7, ref error } if error.contains("timed out")
        ));
    }

    #[tokio::test]
    async fn close_sends_a_close_frame_to_the_device() {
        let (listener, url) = local_listener().await;
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(message)) = ws.next().await {
                if let WsMessage::Close(_) = message {
                    return true;
                }
            }
            false
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut manager = ConnectionManager::new(
            WsConnector::new(Duration::from_secs(5)),
            url,
            Duration::from_secs(5),
            tx,
        );
        manager.connect();
        assert_eq!(next_output(&mut manager, &mut rx).await, ConnectionOutput::Connected);

        manager.close();
        let saw_close = timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert!(saw_close);
        assert!(!manager.reconnect_pending());
    }
}
