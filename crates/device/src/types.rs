use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::DeviceError;

/// Rotation direction as the device names it on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Forward,
    Backward,
    Both,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Forward => "Forward",
            Direction::Backward => "Backward",
            Direction::Both => "Both",
        }
    }
}

impl FromStr for Direction {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "forward" => Ok(Direction::Forward),
            "backward" => Ok(Direction::Backward),
            "both" => Ok(Direction::Both),
            other => Err(DeviceError::Validation(format!(
                "unknown direction '{other}', expected Forward, Backward or Both"
            ))),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Motor action layered onto the settings endpoint and the peer endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Start,
    Stop,
    Reset,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Start => "start",
            Action::Stop => "stop",
            Action::Reset => "reset",
        }
    }
}

impl FromStr for Action {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "start" => Ok(Action::Start),
            "stop" => Ok(Action::Stop),
            "reset" => Ok(Action::Reset),
            other => Err(DeviceError::Validation(format!(
                "unknown action '{other}', expected start, stop or reset"
            ))),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plain-text control frames sent over the real-time channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlToken {
    StatusRequest,
    OtaCheckRequest,
}

impl ControlToken {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlToken::StatusRequest => "status_request",
            ControlToken::OtaCheckRequest => "ota_check_request",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MotorState {
    Running,
    #[default]
    Stopped,
}

impl MotorState {
    pub fn is_running(&self) -> bool {
        matches!(self, MotorState::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OtaSeverity {
    Info,
    Error,
}

/// An OTA message as it should be shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtaNotice {
    pub text: String,
    pub severity: OtaSeverity,
    /// Persistent notices stay until replaced; the rest auto-dismiss.
    pub persistent: bool,
}

impl OtaNotice {
    pub fn dismiss_after(&self, window: Duration) -> Option<Duration> {
        if self.persistent {
            None
        } else {
            Some(window)
        }
    }
}

/// Progress of a user-initiated OTA check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OtaFlow {
    #[default]
    Idle,
    CheckRequested,
    ReportedSuccess,
    ReportedError,
}

/// How the device name should be presented in a name editor.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NameDisplay {
    pub display: String,
    pub input: String,
    pub placeholder: String,
}

impl NameDisplay {
    pub fn has_override(&self) -> bool {
        !self.input.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusModel {
    pub turns_per_day: Option<u32>,
    pub turn_duration: Option<u32>,
    pub direction: Option<Direction>,
    pub custom_name: Option<String>,
    pub default_name: Option<String>,
    pub ip_address: Option<String>,
    pub motor: MotorState,
    pub completed_turns: u64,
    pub firmware_version: Option<String>,
    pub ota_status: Option<OtaNotice>,
}

impl StatusModel {
    pub fn name_display(&self) -> NameDisplay {
        let default_name = self.default_name.clone().unwrap_or_default();
        match self.custom_name.as_deref().filter(|n| !n.is_empty()) {
            Some(custom) => NameDisplay {
                display: custom.to_string(),
                input: custom.to_string(),
                placeholder: String::new(),
            },
            None => NameDisplay {
                display: default_name.clone(),
                input: String::new(),
                placeholder: default_name,
            },
        }
    }

    /// `<hostname>.local`, shown next to the IP address.
    pub fn local_hostname(&self) -> Option<String> {
        self.default_name.as_ref().map(|n| format!("{n}.local"))
    }
}

/// Field identifiers used to tell the front end what changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusField {
    TurnsPerDay,
    TurnDuration,
    Direction,
    DeviceName,
    DefaultName,
    IpAddress,
    Motor,
    CompletedTurns,
    FirmwareVersion,
    OtaStatus,
    Peers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub ssid: String,
    #[serde(default)]
    pub rssi: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanResult {
    #[serde(default)]
    pub networks: Vec<Network>,
}
