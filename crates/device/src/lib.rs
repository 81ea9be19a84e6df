pub mod api;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod peers;
pub mod socket;
pub mod status;
pub mod types;

pub use api::{DeviceTransport, HttpTransport, SettingsRequest};
pub use client::{ClientCommand, HorusClient, HorusEvent};
pub use config::Config;
pub use dispatch::{CommandDispatcher, CommandOutcome};
pub use error::{DeviceError, DeviceResult};
pub use socket::{ConnectionManager, Connector, WsConnector};
pub use types::*;
