use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Not connected to the device")]
    NotConnected,

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Peer {peer} failed: {reason}")]
    Peer { peer: String, reason: String },

    #[error("Adding peer {peer} failed: {reason}")]
    AddPeer { peer: String, reason: String },

    #[error("Config error: {0}")]
    Config(String),
}

impl DeviceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            DeviceError::Transport(_) | DeviceError::Network(_) => {
                "Could not reach the device. Check your connection."
            }
            DeviceError::NotConnected => "Not connected to the device. Try again shortly.",
            DeviceError::Decode(_) => "The device sent an unreadable message.",
            DeviceError::Validation(_) => "Invalid input. Please check the values.",
            DeviceError::Peer { .. } => "Could not reach the other device.",
            DeviceError::AddPeer { .. } => "The device could not be added.",
            DeviceError::Config(_) => "The configuration file could not be read.",
        }
    }

    /// True for failures caused by the link rather than by the request.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            DeviceError::Transport(_) | DeviceError::Network(_) | DeviceError::NotConnected
        )
    }
}

impl From<serde_json::Error> for DeviceError {
    fn from(e: serde_json::Error) -> Self {
        DeviceError::Decode(e.to_string())
    }
}

pub type DeviceResult<T> = Result<T, DeviceError>;
