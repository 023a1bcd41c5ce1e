//! Seam to the radio: the core asks for links and frames through [`Transport`];
//! the radio answers with [`TransportEvent`]s keyed by address.

use std::fmt;

use crate::identity::BdAddr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("radio unavailable: {0}")]
    Unavailable(String),
    #[error("link failed: {0}")]
    LinkFailed(String),
    #[error("send failed: {0}")]
    SendFailed(String),
}

/// Why a link went down. Only `LocalRequest` is an expected loss; state
/// handling is the same for every cause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectCause {
    LocalRequest,
    OutOfRange,
    RemoteClosed,
    Transport(TransportError),
    Protocol(String),
}

impl DisconnectCause {
    pub fn is_expected(&self) -> bool {
        matches!(self, DisconnectCause::LocalRequest)
    }
}

impl fmt::Display for DisconnectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectCause::LocalRequest => f.write_str("disconnect requested"),
            DisconnectCause::OutOfRange => f.write_str("out of range"),
            DisconnectCause::RemoteClosed => f.write_str("closed by button"),
            DisconnectCause::Transport(e) => write!(f, "{e}"),
            DisconnectCause::Protocol(reason) => write!(f, "protocol violation: {reason}"),
        }
    }
}

/// Requests the core makes of the radio. Each call only queues the request and
/// returns; completions arrive later as [`TransportEvent`]s.
///
/// `open_link` has no timeout: the radio keeps trying until the button shows up
/// or `close_link` cancels it.
/// Closing a link that is up completes with a [`LinkEvent::Down`].
pub trait Transport: Send + Sync + 'static {
    fn open_link(&self, address: BdAddr) -> Result<(), TransportError>;
    fn close_link(&self, address: BdAddr) -> Result<(), TransportError>;
    fn send(&self, address: BdAddr, frame: Vec<u8>) -> Result<(), TransportError>;
}

/// Callback from the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEvent {
    pub address: BdAddr,
    pub kind: LinkEvent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Up,
    Down(DisconnectCause),
    /// A pending or active link could not be established or kept.
    Failed(TransportError),
    Frame(Vec<u8>),
}

impl TransportEvent {
    pub fn new(address: BdAddr, kind: LinkEvent) -> Self {
        Self { address, kind }
    }
}
