use std::future::Future;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::api::{DeviceTransport, SettingsRequest};
use crate::error::{DeviceError, DeviceResult};
use crate::socket::{ConnectionManager, Connector};
use crate::types::{Action, ControlToken, Network, OtaFlow, OtaNotice, OtaSeverity};

/// Result of a command that went out over the request/response side.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    SettingsApplied {
        request: SettingsRequest,
        error: Option<String>,
    },
    PeerAdded {
        peer: String,
        error: Option<String>,
    },
    PeerControlled {
        peer: String,
        action: Action,
        error: Option<String>,
    },
    NetworksScanned {
        networks: Vec<Network>,
        error: Option<String>,
    },
    WifiSaved {
        ssid: String,
        error: Option<String>,
    },
    DeviceNameSaved {
        name: String,
        error: Option<String>,
    },
}

impl CommandOutcome {
    pub fn error(&self) -> Option<&str> {
        match self {
            CommandOutcome::SettingsApplied { error, .. }
            | CommandOutcome::PeerAdded { error, .. }
            | CommandOutcome::PeerControlled { error, .. }
            | CommandOutcome::NetworksScanned { error, .. }
            | CommandOutcome::WifiSaved { error, .. }
            | CommandOutcome::DeviceNameSaved { error, .. } => error.as_deref(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error().is_none()
    }

    /// Local-device changes are confirmed by pulling a fresh status frame.
    pub fn needs_status_refresh(&self) -> bool {
        self.is_success()
            && matches!(
                self,
                CommandOutcome::SettingsApplied { .. }
                    | CommandOutcome::PeerAdded { .. }
                    | CommandOutcome::DeviceNameSaved { .. }
            )
    }
}

/// Issues user commands. Request/response work runs in its own task and
/// reports back through the outcome channel; nothing here mutates the status
/// model.
pub struct CommandDispatcher<T: DeviceTransport> {
    transport: T,
    outcomes: mpsc::UnboundedSender<CommandOutcome>,
    ota: OtaFlow,
}

impl<T: DeviceTransport> CommandDispatcher<T> {
    pub fn new(transport: T, outcomes: mpsc::UnboundedSender<CommandOutcome>) -> Self {
        Self {
            transport,
            outcomes,
            ota: OtaFlow::Idle,
        }
    }

    pub fn ota_flow(&self) -> OtaFlow {
        self.ota
    }

    pub fn apply_local_settings(
        &self,
        turns_per_day: i64,
        turn_duration: i64,
        direction: &str,
        action: Option<Action>,
    ) -> DeviceResult<()> {
        let request = SettingsRequest::new(turns_per_day, turn_duration, direction, action)?;
        info!(
            tpd = request.turns_per_day,
            duration = request.turn_duration,
            dir = %request.direction,
            action = ?request.action,
            "Sending settings"
        );

        let transport = self.transport.clone();
        self.spawn(async move {
            let error = transport.apply_settings(&request).await.err().map(|e| e.to_string());
            CommandOutcome::SettingsApplied { request, error }
        });
        Ok(())
    }

    /// One independent task per call; the outcome is reported for this peer
    /// only.
    pub fn control_peer(&self, peer: &str, action: Action) {
        info!("Sending {} command to {}...", action, peer);
        let transport = self.transport.clone();
        let peer = peer.to_string();
        self.spawn(async move {
            let error = match transport.control_peer(&peer, action).await {
                Ok(body) => {
                    info!("Response from {}: {}", peer, body);
                    None
                }
                Err(e) => {
                    warn!("Control device ({}) error: {}", peer, e);
                    Some(e.to_string())
                }
            };
            CommandOutcome::PeerControlled {
                peer,
                action,
                error,
            }
        });
    }

    pub fn control_peers(&self, peers: &[String], action: Action) -> usize {
        for peer in peers {
            self.control_peer(peer, action);
        }
        peers.len()
    }

    pub fn add_peer(&self, identifier: &str) -> DeviceResult<()> {
        let peer = identifier.trim().to_string();
        if peer.is_empty() {
            return Err(DeviceError::Validation(
                "enter the mDNS name of the device to add".to_string(),
            ));
        }

        let transport = self.transport.clone();
        self.spawn(async move {
            let error = transport.add_peer(&peer).await.err().map(|e| e.to_string());
            CommandOutcome::PeerAdded { peer, error }
        });
        Ok(())
    }

    pub fn request_ota_check<C: Connector>(
        &mut self,
        connection: &ConnectionManager<C>,
    ) -> DeviceResult<()> {
        connection.send_control(ControlToken::OtaCheckRequest)?;
        info!("OTA check requested");
        self.ota = OtaFlow::CheckRequested;
        Ok(())
    }

    /// Advances the OTA flow from a device-reported message.
    pub fn observe_ota(&mut self, notice: &OtaNotice) {
        if self.ota == OtaFlow::Idle {
            return;
        }
        self.ota = match notice.severity {
            OtaSeverity::Error => OtaFlow::ReportedError,
            OtaSeverity::Info => OtaFlow::ReportedSuccess,
        };
    }

    pub fn scan_networks(&self) {
        let transport = self.transport.clone();
        self.spawn(async move {
            match transport.scan_networks().await {
                Ok(result) => CommandOutcome::NetworksScanned {
                    networks: result.networks,
                    error: None,
                },
                Err(e) => CommandOutcome::NetworksScanned {
                    networks: Vec::new(),
                    error: Some(e.to_string()),
                },
            }
        });
    }

    pub fn save_wifi(&self, ssid: &str, password: &str) -> DeviceResult<()> {
        if ssid.trim().is_empty() {
            return Err(DeviceError::Validation("network name is required".to_string()));
        }
        let transport = self.transport.clone();
        let ssid = ssid.to_string();
        let password = password.to_string();
        self.spawn(async move {
            let error = transport
                .save_wifi(&ssid, &password)
                .await
                .err()
                .map(|e| e.to_string());
            CommandOutcome::WifiSaved { ssid, error }
        });
        Ok(())
    }

    /// An empty name reverts the device to its default name.
    pub fn save_device_name(&self, name: &str) {
        let transport = self.transport.clone();
        let name = name.trim().to_string();
        self.spawn(async move {
            let error = transport
                .save_device_name(&name)
                .await
                .err()
                .map(|e| e.to_string());
            CommandOutcome::DeviceNameSaved { name, error }
        });
    }

    pub fn reset_device_name(&self) {
        self.save_device_name("");
    }

    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = CommandOutcome> + Send + 'static,
    {
        let tx = self.outcomes.clone();
        tokio::spawn(async move {
            let outcome = future.await;
            let _ = tx.send(outcome);
        });
    }
}
