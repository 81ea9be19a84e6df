//! The single owner of connection, status and dispatch state.
//!
//! Every mutation happens inside [`HorusClient::step`] (or
//! [`HorusClient::process_pending`]), one event at a time, so the status model
//! and peer registry never see concurrent writers even though requests run in
//! their own tasks.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::api::DeviceTransport;
use crate::config::Config;
use crate::dispatch::{CommandDispatcher, CommandOutcome};
use crate::error::DeviceError;
use crate::peers::PeerRegistry;
use crate::socket::{ChannelEvent, ConnectionManager, ConnectionOutput, Connector};
use crate::status::{StatusSync, StatusUpdate};
use crate::types::{
    Action, ConnectionState, OtaFlow, OtaNotice, OtaSeverity, StatusField, StatusModel,
};

/// User intents accepted by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    ApplySettings {
        turns_per_day: i64,
        turn_duration: i64,
        direction: String,
        action: Option<Action>,
    },
    /// Re-sends the last known settings together with an action.
    Motor(Action),
    ControlPeer {
        peer: String,
        action: Action,
    },
    ControlAllPeers(Action),
    AddPeer(String),
    RequestStatus,
    CheckOta,
    ScanNetworks,
    SaveWifi {
        ssid: String,
        password: String,
    },
    SaveDeviceName(String),
    ResetDeviceName,
    Shutdown,
}

/// Notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum HorusEvent {
    Connected,
    Disconnected,
    StatusChanged {
        changed: Vec<StatusField>,
        model: StatusModel,
        /// When the frame carrying this change arrived.
        received_at: Option<DateTime<Utc>>,
    },
    PeersChanged(Vec<String>),
    OtaShown(OtaNotice),
    OtaDismissed,
    CommandFinished(CommandOutcome),
    CommandRejected {
        context: String,
        /// Short text fit for showing to a person.
        hint: &'static str,
        error: String,
    },
}

pub struct HorusClient<C: Connector, T: DeviceTransport> {
    connection: ConnectionManager<C>,
    sync: StatusSync,
    dispatcher: CommandDispatcher<T>,
    ota_window: Duration,
    ota_seq: u64,
    ota_visible: bool,
    channel_rx: mpsc::UnboundedReceiver<ChannelEvent>,
    outcome_rx: mpsc::UnboundedReceiver<CommandOutcome>,
    dismiss_tx: mpsc::UnboundedSender<u64>,
    dismiss_rx: mpsc::UnboundedReceiver<u64>,
    command_tx: mpsc::UnboundedSender<ClientCommand>,
    command_rx: mpsc::UnboundedReceiver<ClientCommand>,
    event_tx: mpsc::UnboundedSender<HorusEvent>,
    stopped: bool,
}

impl<C: Connector, T: DeviceTransport> HorusClient<C, T> {
    pub fn new(
        config: &Config,
        connector: C,
        transport: T,
    ) -> (Self, mpsc::UnboundedReceiver<HorusEvent>) {
        let (channel_tx, channel_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let (dismiss_tx, dismiss_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let connection = ConnectionManager::new(
            connector,
            config.device.ws_url(),
            config.connection.reconnect_interval(),
            channel_tx,
        );

        let client = Self {
            connection,
            sync: StatusSync::new(),
            dispatcher: CommandDispatcher::new(transport, outcome_tx),
            ota_window: config.display.ota_message_window(),
            ota_seq: 0,
            ota_visible: false,
            channel_rx,
            outcome_rx,
            dismiss_tx,
            dismiss_rx,
            command_tx,
            command_rx,
            event_tx,
            stopped: false,
        };
        (client, event_rx)
    }

    pub fn commands(&self) -> mpsc::UnboundedSender<ClientCommand> {
        self.command_tx.clone()
    }

    pub fn model(&self) -> &StatusModel {
        self.sync.model()
    }

    pub fn peers(&self) -> &PeerRegistry {
        self.sync.peers()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn ota_flow(&self) -> OtaFlow {
        self.dispatcher.ota_flow()
    }

    pub fn ota_visible(&self) -> bool {
        self.ota_visible
    }

    pub fn start(&mut self) {
        self.connection.connect();
    }

    /// Runs until a `Shutdown` command arrives.
    pub async fn run(mut self) {
        self.start();
        while self.step().await {}
        self.connection.dispose();
        info!("Horus client stopped");
    }

    /// Waits for the next event from any source and handles it. Returns false
    /// once the client has been asked to stop.
    pub async fn step(&mut self) -> bool {
        tokio::select! {
            Some(event) = self.channel_rx.recv() => self.on_channel_event(event),
            Some(outcome) = self.outcome_rx.recv() => self.on_outcome(outcome),
            Some(seq) = self.dismiss_rx.recv() => self.on_dismiss(seq),
            Some(command) = self.command_rx.recv() => self.on_command(command),
            else => self.stopped = true,
        }
        !self.stopped
    }

    /// Handles everything already queued without waiting.
    pub fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        loop {
            let before = handled;
            while let Ok(event) = self.channel_rx.try_recv() {
                self.on_channel_event(event);
                handled += 1;
            }
            while let Ok(outcome) = self.outcome_rx.try_recv() {
                self.on_outcome(outcome);
                handled += 1;
            }
            while let Ok(seq) = self.dismiss_rx.try_recv() {
                self.on_dismiss(seq);
                handled += 1;
            }
            while let Ok(command) = self.command_rx.try_recv() {
                self.on_command(command);
                handled += 1;
            }
            if handled == before {
                return handled;
            }
        }
    }

    fn emit(&self, event: HorusEvent) {
        let _ = self.event_tx.send(event);
    }

    fn on_channel_event(&mut self, event: ChannelEvent) {
        match self.connection.handle_event(event) {
            Some(ConnectionOutput::Connected) => self.emit(HorusEvent::Connected),
            Some(ConnectionOutput::Disconnected) => self.emit(HorusEvent::Disconnected),
            Some(ConnectionOutput::Frame(text)) => self.on_frame(&text),
            None => {}
        }
    }

    fn on_frame(&mut self, text: &str) {
        match self.sync.apply_frame(text) {
            Ok(update) => self.publish(update),
            Err(e) => warn!("JSON parse error: {}", e),
        }
    }

    fn publish(&mut self, update: StatusUpdate) {
        if update.touched(StatusField::Peers) {
            self.emit(HorusEvent::PeersChanged(self.sync.peers().list().to_vec()));
        }

        let changed: Vec<StatusField> = update
            .changed
            .iter()
            .copied()
            .filter(|f| *f != StatusField::Peers)
            .collect();
        if !changed.is_empty() {
            self.emit(HorusEvent::StatusChanged {
                changed,
                model: self.sync.model().clone(),
                received_at: self.connection.last_frame_at(),
            });
        }

        if let Some(notice) = update.ota {
            self.dispatcher.observe_ota(&notice);
            self.show_ota(notice);
        }
    }

    fn show_ota(&mut self, notice: OtaNotice) {
        self.ota_seq += 1;
        self.ota_visible = true;

        if let Some(after) = notice.dismiss_after(self.ota_window) {
            let seq = self.ota_seq;
            let tx = self.dismiss_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                let _ = tx.send(seq);
            });
        }
        self.emit(HorusEvent::OtaShown(notice));
    }

    fn on_dismiss(&mut self, seq: u64) {
        // A newer message replaced this one; its own timer (if any) decides.
        if seq != self.ota_seq || !self.ota_visible {
            return;
        }
        self.ota_visible = false;
        self.emit(HorusEvent::OtaDismissed);
    }

    fn on_outcome(&mut self, outcome: CommandOutcome) {
        match outcome.error() {
            Some(error) => warn!(?outcome, "Command failed: {}", error),
            None => debug!(?outcome, "Command finished"),
        }
        if outcome.needs_status_refresh() {
            self.connection.request_status();
        }
        self.emit(HorusEvent::CommandFinished(outcome));
    }

    fn reject(&self, context: &str, error: DeviceError) {
        warn!("{}: {}", context, error);
        self.emit(HorusEvent::CommandRejected {
            context: context.to_string(),
            hint: error.user_message(),
            error: error.to_string(),
        });
    }

    fn on_command(&mut self, command: ClientCommand) {
        debug!(?command, "Handling command");
        match command {
            ClientCommand::ApplySettings {
                turns_per_day,
                turn_duration,
                direction,
                action,
            } => {
                if let Err(e) = self.dispatcher.apply_local_settings(
                    turns_per_day,
                    turn_duration,
                    &direction,
                    action,
                ) {
                    self.reject("Apply settings", e);
                }
            }
            ClientCommand::Motor(action) => self.motor(action),
            ClientCommand::ControlPeer { peer, action } => {
                self.dispatcher.control_peer(&peer, action);
            }
            ClientCommand::ControlAllPeers(action) => {
                let peers = self.sync.peers().list().to_vec();
                if peers.is_empty() {
                    info!("No other devices to control");
                }
                self.dispatcher.control_peers(&peers, action);
            }
            ClientCommand::AddPeer(name) => {
                if let Err(e) = self.dispatcher.add_peer(&name) {
                    self.reject("Add device", e);
                }
            }
            ClientCommand::RequestStatus => self.connection.request_status(),
            ClientCommand::CheckOta => self.check_ota(),
            ClientCommand::ScanNetworks => self.dispatcher.scan_networks(),
            ClientCommand::SaveWifi { ssid, password } => {
                if let Err(e) = self.dispatcher.save_wifi(&ssid, &password) {
                    self.reject("Save Wi-Fi", e);
                }
            }
            ClientCommand::SaveDeviceName(name) => self.dispatcher.save_device_name(&name),
            ClientCommand::ResetDeviceName => self.dispatcher.reset_device_name(),
            ClientCommand::Shutdown => {
                info!("Shutdown requested");
                self.stopped = true;
            }
        }
    }

    fn motor(&mut self, action: Action) {
        let model = self.sync.model();
        let (Some(tpd), Some(duration), Some(direction)) =
            (model.turns_per_day, model.turn_duration, model.direction)
        else {
            self.reject(
                "Motor control",
                DeviceError::Validation("settings not received from the device yet".to_string()),
            );
            return;
        };

        if let Err(e) = self.dispatcher.apply_local_settings(
            i64::from(tpd),
            i64::from(duration),
            direction.as_str(),
            Some(action),
        ) {
            self.reject("Motor control", e);
        }
    }

    fn check_ota(&mut self) {
        match self.dispatcher.request_ota_check(&self.connection) {
            Ok(()) => self.show_ota(OtaNotice {
                text: "Checking for updates...".to_string(),
                severity: OtaSeverity::Info,
                persistent: true,
            }),
            Err(e) => {
                self.show_ota(OtaNotice {
                    text: "Could not connect to the device to check for updates.".to_string(),
                    severity: OtaSeverity::Error,
                    persistent: false,
                });
                self.reject("OTA check", e);
            }
        }
    }
}
