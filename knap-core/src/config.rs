//! Manager configuration.

use serde::Deserialize;

use crate::protocol::TriggerMode;

/// Limits and defaults shared by every session a manager creates.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManagerConfig {
    /// Trigger mode given to newly added buttons.
    #[serde(default)]
    pub default_trigger_mode: TriggerMode,
    /// Frames held while verification runs (default 64). More is a protocol violation.
    #[serde(default = "default_max_pending_frames")]
    pub max_pending_frames: usize,
    /// Queued events held during one connection burst (default 512).
    #[serde(default = "default_max_queued_events")]
    pub max_queued_events: usize,
    /// Acknowledge delivered events so the button drops them (default true).
    #[serde(default = "default_ack_events")]
    pub ack_events: bool,
}

fn default_max_pending_frames() -> usize {
    64
}
fn default_max_queued_events() -> usize {
    512
}
fn default_ack_events() -> bool {
    true
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            default_trigger_mode: TriggerMode::default(),
            max_pending_frames: default_max_pending_frames(),
            max_queued_events: default_max_queued_events(),
            ack_events: default_ack_events(),
        }
    }
}
