//! Knap button client core.
//! Host-driven: sessions do no I/O; the registry runs one task per button and
//! talks to the radio through the [`Transport`] trait.

pub mod config;
pub mod decoder;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transport;
pub mod verify;
pub mod wire;

pub use config::ManagerConfig;
pub use decoder::{ButtonEvent, EventDecoder};
pub use error::ButtonError;
pub use identity::{BdAddr, ButtonId, ButtonIdentity, PairingRecord, PairingSecret, PublicKey};
pub use protocol::{EventFilter, EventKind, Message, RevokeReason, TriggerMode, PROTOCOL_VERSION};
pub use registry::{ButtonHandle, ButtonManager, ManagerEvent, RegistryError};
pub use session::{ButtonStatus, ConnectionState, Notification, Session, SessionAction};
pub use transport::{DisconnectCause, LinkEvent, Transport, TransportError, TransportEvent};
pub use verify::{Responder, SessionKeys, VerificationError};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
