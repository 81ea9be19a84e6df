//! Reconciles inbound status payloads against the in-memory model.
//!
//! The device omits fields it has nothing to say about, and it also sends zero
//! or an empty string for values that are unset. Both cases are treated as
//! "absent" here so a partial payload never wipes a known value.

use serde_json::Value;
use tracing::debug;

use crate::error::{DeviceError, DeviceResult};
use crate::peers::PeerRegistry;
use crate::types::{Direction, MotorState, OtaNotice, OtaSeverity, StatusField, StatusModel};

const RUNNING_TOKENS: &[&str] = &["çalışıyor", "running"];
const OTA_ERROR_TOKENS: &[&str] = &["hata", "başarısız", "fail", "error"];
const OTA_IN_PROGRESS_TOKENS: &[&str] = &["indiriliyor", "downloading"];
// Up to two words before a token, or the word right after it, can negate it.
const NEGATIONS_BEFORE: &[&str] = &["not", "no", "never", "without"];
const NEGATIONS_AFTER: &[&str] = &["yok", "değil"];

/// What a single payload changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusUpdate {
    pub changed: Vec<StatusField>,
    /// Set whenever the payload carried an OTA message, changed or not.
    pub ota: Option<OtaNotice>,
}

impl StatusUpdate {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.ota.is_none()
    }

    pub fn touched(&self, field: StatusField) -> bool {
        self.changed.contains(&field)
    }
}

#[derive(Debug, Clone, Default)]
pub struct StatusSync {
    model: StatusModel,
    peers: PeerRegistry,
}

impl StatusSync {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn model(&self) -> &StatusModel {
        &self.model
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    /// Decodes a raw text frame and applies it.
    pub fn apply_frame(&mut self, raw: &str) -> DeviceResult<StatusUpdate> {
        let payload: Value = serde_json::from_str(raw)?;
        if !payload.is_object() {
            return Err(DeviceError::Decode(format!(
                "status payload is not an object: {}",
                truncate(raw, 64)
            )));
        }
        Ok(self.apply(&payload))
    }

    pub fn apply(&mut self, payload: &Value) -> StatusUpdate {
        let mut update = StatusUpdate::default();
        let model = &mut self.model;

        if let Some(tpd) = payload.get("tpd").and_then(positive_u32) {
            set(&mut model.turns_per_day, Some(tpd), StatusField::TurnsPerDay, &mut update);
        }
        if let Some(duration) = payload.get("duration").and_then(positive_u32) {
            set(&mut model.turn_duration, Some(duration), StatusField::TurnDuration, &mut update);
        }
        if let Some(direction) = payload
            .get("direction")
            .and_then(text)
            .and_then(|d| d.parse::<Direction>().ok())
        {
            set(&mut model.direction, Some(direction), StatusField::Direction, &mut update);
        }

        // An explicit empty customName is how the device reports a reset to
        // the default name, so only a missing key leaves the override alone.
        if let Some(custom) = payload.get("customName") {
            let custom = text(custom);
            set(&mut model.custom_name, custom, StatusField::DeviceName, &mut update);
        }
        if let Some(hostname) = payload.get("mDNSHostname").and_then(text) {
            set(&mut model.default_name, Some(hostname), StatusField::DefaultName, &mut update);
        }
        if let Some(ip) = payload.get("ip").and_then(text) {
            set(&mut model.ip_address, Some(ip), StatusField::IpAddress, &mut update);
        }

        let motor = match payload.get("running").and_then(Value::as_bool) {
            Some(true) => Some(MotorState::Running),
            Some(false) => Some(MotorState::Stopped),
            None => payload
                .get("motorStatus")
                .and_then(text)
                .map(|s| classify_motor_status(&s)),
        };
        if let Some(motor) = motor {
            set(&mut model.motor, motor, StatusField::Motor, &mut update);
        }

        if let Some(turns) = payload.get("completedTurns").and_then(positive_u64) {
            set(&mut model.completed_turns, turns, StatusField::CompletedTurns, &mut update);
        }
        if let Some(version) = payload.get("version").and_then(text) {
            set(&mut model.firmware_version, Some(version), StatusField::FirmwareVersion, &mut update);
        }
        if let Some(ota) = payload.get("otaStatus").and_then(text) {
            let notice = classify_ota(&ota);
            set(&mut model.ota_status, Some(notice.clone()), StatusField::OtaStatus, &mut update);
            update.ota = Some(notice);
        }

        if let Some(list) = payload.get("otherHorus").and_then(Value::as_array) {
            let names = list
                .iter()
                .filter_map(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            if self.peers.replace(names) {
                update.changed.push(StatusField::Peers);
            }
        }

        if !update.is_empty() {
            debug!(changed = ?update.changed, "Applied status payload");
        }
        update
    }
}

fn set<T: PartialEq>(slot: &mut T, value: T, field: StatusField, update: &mut StatusUpdate) {
    if *slot != value {
        *slot = value;
        update.changed.push(field);
    }
}

/// Maps the device's human-readable motor status to a state. Anything not
/// recognised as running is reported as stopped.
pub fn classify_motor_status(status: &str) -> MotorState {
    if mentions(status, RUNNING_TOKENS) {
        MotorState::Running
    } else {
        MotorState::Stopped
    }
}

pub fn classify_ota(message: &str) -> OtaNotice {
    let severity = if mentions(message, OTA_ERROR_TOKENS) {
        OtaSeverity::Error
    } else {
        OtaSeverity::Info
    };
    OtaNotice {
        text: message.to_string(),
        severity,
        persistent: mentions(message, OTA_IN_PROGRESS_TOKENS),
    }
}

/// True when some word starts with one of `tokens` and is not negated.
fn mentions(text: &str, tokens: &[&str]) -> bool {
    let lowered = text.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .filter(|w| !w.is_empty())
        .collect();
    words
        .iter()
        .enumerate()
        .any(|(i, word)| tokens.iter().any(|t| word.starts_with(t)) && !negated(&words, i))
}

fn negated(words: &[&str], at: usize) -> bool {
    let before = &words[at.saturating_sub(2)..at];
    before
        .iter()
        .any(|w| NEGATIONS_BEFORE.contains(w) || w.ends_with("n't"))
        || words
            .get(at + 1)
            .is_some_and(|w| NEGATIONS_AFTER.contains(w))
}

/// Non-empty string, or a number rendered as text.
fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) if n.as_f64() != Some(0.0) => Some(n.to_string()),
        _ => None,
    }
}

fn positive_u64(value: &Value) -> Option<u64> {
    let n = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }?;
    (n > 0).then_some(n)
}

fn positive_u32(value: &Value) -> Option<u32> {
    positive_u64(value).and_then(|n| u32::try_from(n).ok())
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
