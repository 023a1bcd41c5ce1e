//! Button link protocol: message types, event categories, trigger modes.

use std::str::FromStr;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::identity::PublicKey;

/// Current protocol version. Carried in both verification messages.
pub const PROTOCOL_VERSION: u8 = 1;

/// Category of a physical button action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Down,
    Up,
    Click,
    DoubleClick,
    Hold,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::Down,
        EventKind::Up,
        EventKind::Click,
        EventKind::DoubleClick,
        EventKind::Hold,
    ];
}

bitflags! {
    /// Set of event categories a session asks the button to report.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct EventFilter: u8 {
        const DOWN = 1 << 0;
        const UP = 1 << 1;
        const CLICK = 1 << 2;
        const DOUBLE_CLICK = 1 << 3;
        const HOLD = 1 << 4;
    }
}

impl EventFilter {
    pub fn of(kind: EventKind) -> Self {
        match kind {
            EventKind::Down => EventFilter::DOWN,
            EventKind::Up => EventFilter::UP,
            EventKind::Click => EventFilter::CLICK,
            EventKind::DoubleClick => EventFilter::DOUBLE_CLICK,
            EventKind::Hold => EventFilter::HOLD,
        }
    }

    pub fn allows(&self, kind: EventKind) -> bool {
        self.contains(Self::of(kind))
    }
}

/// Preset filters. Narrower modes let the button report clicks sooner since it
/// no longer waits to tell a click from a double click or a hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    #[default]
    ClickAndDoubleClickAndHold,
    ClickAndDoubleClick,
    ClickAndHold,
    Click,
}

impl TriggerMode {
    pub fn filter(self) -> EventFilter {
        let edges = EventFilter::DOWN | EventFilter::UP;
        match self {
            TriggerMode::ClickAndDoubleClickAndHold => EventFilter::all(),
            TriggerMode::ClickAndDoubleClick => {
                edges | EventFilter::CLICK | EventFilter::DOUBLE_CLICK
            }
            TriggerMode::ClickAndHold => edges | EventFilter::CLICK | EventFilter::HOLD,
            TriggerMode::Click => EventFilter::CLICK,
        }
    }
}

impl From<TriggerMode> for EventFilter {
    fn from(mode: TriggerMode) -> Self {
        mode.filter()
    }
}

impl FromStr for TriggerMode {
    type Err = UnknownTriggerMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "click_and_double_click_and_hold" | "all" => Ok(TriggerMode::ClickAndDoubleClickAndHold),
            "click_and_double_click" => Ok(TriggerMode::ClickAndDoubleClick),
            "click_and_hold" => Ok(TriggerMode::ClickAndHold),
            "click" => Ok(TriggerMode::Click),
            _ => Err(UnknownTriggerMode(s.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown trigger mode {0:?}")]
pub struct UnknownTriggerMode(pub String);

/// Why a button no longer honours this host's pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevokeReason {
    FactoryReset,
    MaxPairingsExceeded,
    PairingRemoved,
}

/// All link messages. Encoding is bincode; framing is length-prefix (see wire module).
/// Verification messages travel in the clear; everything after is sealed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Host → button: start verification.
    VerifyRequest {
        protocol_version: u8,
        host_nonce: [u8; 16],
        host_public: PublicKey,
    },
    /// Button → host: proof of the pairing secret bound to both nonces and keys.
    VerifyResponse {
        protocol_version: u8,
        device_nonce: [u8; 16],
        device_public: PublicKey,
        serial_number: String,
        firmware_revision: u32,
        tag: [u8; 32],
    },
    /// Button → host: the button does not know this pairing any more.
    VerifyRejected { reason: RevokeReason },
    /// Host → button: categories the host wants reported.
    SetTriggerMode { filter: EventFilter },
    /// Host → button: events up to and including `through_seq` were delivered; drop them.
    AckEvents { through_seq: u32 },
    /// Button → host: one button action. `timestamp_ms` and `device_time_ms` are on the
    /// button's clock; their difference is the event's age.
    ButtonEvent {
        seq: u32,
        kind: EventKind,
        queued: bool,
        timestamp_ms: u64,
        device_time_ms: u64,
        press_count: u32,
    },
    /// Button → host: every queued event of this connection has been sent.
    QueueDrained,
    /// Button → host: raw battery sample.
    BatteryStatus { level: u16 },
    /// Button → host: pairing revoked while connected.
    PairingRevoked { reason: RevokeReason },
}
