use chrono::{DateTime, Local, Utc};
use horus_device::CommandOutcome;
use horus_device::{HorusEvent, OtaSeverity, StatusModel};

/// The front end's picture of the device, rebuilt from client events only.
#[derive(Debug, Default)]
pub struct View {
    connected: bool,
    model: StatusModel,
    peers: Vec<String>,
    last_update: Option<DateTime<Utc>>,
}

impl View {
    /// Folds an event into the view and returns the lines to print for it.
    pub fn apply(&mut self, event: &HorusEvent) -> Vec<String> {
        match event {
            HorusEvent::Connected => {
                self.connected = true;
                vec!["Connected to device".to_string()]
            }
            HorusEvent::Disconnected => {
                self.connected = false;
                vec!["Connection lost, reconnecting...".to_string()]
            }
            HorusEvent::StatusChanged {
                model, received_at, ..
            } => {
                self.model = model.clone();
                self.last_update = received_at.or(self.last_update);
                vec![self.summary()]
            }
            HorusEvent::PeersChanged(peers) => {
                self.peers = peers.clone();
                self.peer_lines()
            }
            HorusEvent::OtaShown(notice) => {
                let tag = match notice.severity {
                    OtaSeverity::Error => "error",
                    OtaSeverity::Info => "info",
                };
                vec![format!("[ota {tag}] {}", notice.text)]
            }
            HorusEvent::OtaDismissed => Vec::new(),
            HorusEvent::CommandFinished(outcome) => outcome_lines(outcome),
            HorusEvent::CommandRejected {
                context,
                hint,
                error,
            } => vec![format!("{context}: {hint} ({error})")],
        }
    }

    pub fn summary(&self) -> String {
        let m = &self.model;
        format!(
            "{} | motor {} | {} turns | {}/day, {} s, {}",
            self.model.name_display().display,
            if m.motor.is_running() { "running" } else { "stopped" },
            m.completed_turns,
            opt(m.turns_per_day),
            opt(m.turn_duration),
            m.direction.map(|d| d.to_string()).unwrap_or_else(|| "-".to_string()),
        )
    }

    pub fn status_lines(&self) -> Vec<String> {
        let m = &self.model;
        let name = m.name_display();
        let mut lines = vec![
            format!(
                "Connection:      {}",
                if self.connected { "connected" } else { "disconnected" }
            ),
            if name.has_override() {
                format!("Device name:     {}", name.display)
            } else {
                format!("Device name:     {} (default)", name.display)
            },
        ];
        if let Some(ip) = &m.ip_address {
            match m.local_hostname() {
                Some(host) => lines.push(format!("IP address:      {ip} ({host})")),
                None => lines.push(format!("IP address:      {ip}")),
            }
        }
        lines.push(format!(
            "Motor:           {}",
            if m.motor.is_running() { "running" } else { "stopped" }
        ));
        lines.push(format!("Completed turns: {}", m.completed_turns));
        lines.push(format!("Turns per day:   {}", opt(m.turns_per_day)));
        lines.push(format!("Turn duration:   {} s", opt(m.turn_duration)));
        lines.push(format!(
            "Direction:       {}",
            m.direction.map(|d| d.to_string()).unwrap_or_else(|| "-".to_string())
        ));
        lines.push(format!(
            "Firmware:        {}",
            m.firmware_version.as_deref().unwrap_or("-")
        ));
        lines.push(format!(
            "Last update:     {}",
            self.last_update
                .map(|at| at.with_timezone(&Local).format("%H:%M:%S").to_string())
                .unwrap_or_else(|| "never".to_string())
        ));
        lines
    }

    pub fn peer_lines(&self) -> Vec<String> {
        if self.peers.is_empty() {
            return vec!["No other Horus devices".to_string()];
        }
        self.peers.iter().map(|p| format!("  {p}.local")).collect()
    }
}

fn opt(value: Option<u32>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

fn outcome_lines(outcome: &CommandOutcome) -> Vec<String> {
    match outcome {
        CommandOutcome::SettingsApplied { error: None, .. } => vec!["Settings sent".to_string()],
        CommandOutcome::SettingsApplied { error: Some(e), .. } => {
            vec![format!("Settings failed: {e}")]
        }
        CommandOutcome::PeerAdded { peer, error: None } => vec![format!("Device added: {peer}")],
        CommandOutcome::PeerAdded { peer, error: Some(e) } => {
            vec![format!("Could not add {peer}: {e}")]
        }
        CommandOutcome::PeerControlled {
            peer,
            action,
            error: None,
        } => vec![format!("{peer}.local: {action} sent")],
        CommandOutcome::PeerControlled {
            peer,
            error: Some(e),
            ..
        } => vec![format!("Could not reach {peer}.local: {e}")],
        CommandOutcome::NetworksScanned { error: Some(e), .. } => vec![format!("Scan failed: {e}")],
        CommandOutcome::NetworksScanned { networks, .. } if networks.is_empty() => {
            vec!["No networks found".to_string()]
        }
        CommandOutcome::NetworksScanned { networks, .. } => networks
            .iter()
            .map(|n| format!("  {} ({})", n.ssid, n.rssi))
            .collect(),
        CommandOutcome::WifiSaved { ssid, error: None } => {
            vec![format!("Wi-Fi settings for {ssid} saved")]
        }
        CommandOutcome::WifiSaved { error: Some(e), .. } => {
            vec![format!("Saving Wi-Fi failed: {e}")]
        }
        CommandOutcome::DeviceNameSaved { name, error: None } if name.is_empty() => {
            vec!["Device name reset".to_string()]
        }
        CommandOutcome::DeviceNameSaved { name, error: None } => {
            vec![format!("Device name set to {name}")]
        }
        CommandOutcome::DeviceNameSaved { error: Some(e), .. } => {
            vec![format!("Saving name failed: {e}")]
        }
    }
}

pub fn stamp(line: &str) -> String {
    format!("{} {}", Local::now().format("%H:%M:%S"), line)
}
