//! Per-button session state machine. Host-driven: no I/O; the owner passes
//! inputs and executes the returned actions in order.
//!
//! ```text
//!                connect()              link up
//! Disconnected ───────────▶ Connecting ─────────▶ Connected ──┐ verified
//!      ▲  ▲                    │ disconnect()       │  ready ◀─┘
//!      │  └────────────────────┘                    │ disconnect()
//!      │            link down                        ▼
//!      └─────────────────────────────────────── Disconnecting
//! ```
//!
//! Link loss, verification failure and unpairing all land in `Disconnected`
//! and clear readiness in the same step. Nothing reconnects on its own.

use tracing::{debug, info, warn};

use crate::config::ManagerConfig;
use crate::decoder::{ButtonEvent, Decoded, EventDecoder};
use crate::error::ButtonError;
use crate::identity::{BdAddr, ButtonId, ButtonIdentity, PairingRecord};
use crate::protocol::{EventFilter, Message, RevokeReason};
use crate::transport::{DisconnectCause, TransportError};
use crate::verify::{SessionKeys, VerificationError, Verified, Verifier, VerifyJob};
use crate::wire::{self, Sealer};

/// Battery sample that maps to the replacement threshold voltage.
const LOW_BATTERY_VOLTS: f32 = 2.65;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Consumer-visible outcome of a session. Variants a consumer does not care
/// about can simply be ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A new link is up; verification has started.
    Connected,
    /// Verification succeeded; button events follow.
    Ready,
    Disconnected(Option<DisconnectCause>),
    /// The attempt ended before the button became ready. Not retried.
    ConnectFailed(ButtonError),
    Button(ButtonEvent),
    /// Sticky: every later `connect` fails with [`ButtonError::Unpaired`].
    Unpaired(Option<RevokeReason>),
    BatteryLevel(u16),
}

/// Work the owner performs for the session, in order.
#[derive(Debug)]
pub enum SessionAction {
    OpenLink(BdAddr),
    CloseLink(BdAddr),
    Send(BdAddr, Vec<u8>),
    /// Run off the session's thread, then report through
    /// [`Session::on_verification_complete`].
    Verify(VerifyJob),
    Notify(Notification),
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ButtonStatus {
    pub identity: ButtonIdentity,
    pub state: ConnectionState,
    pub ready: bool,
    pub unpaired: bool,
    /// Last raw battery sample, if one arrived since the session was created.
    pub battery_level: Option<u16>,
    /// Reported by the button; resets when the button reboots.
    pub press_count: u32,
    pub filter: EventFilter,
}

impl ButtonStatus {
    pub fn battery_voltage(&self) -> Option<f32> {
        self.battery_level.map(battery_voltage)
    }

    pub fn needs_battery_replacement(&self) -> bool {
        self.battery_voltage()
            .is_some_and(|volts| volts < LOW_BATTERY_VOLTS)
    }
}

/// Convert a raw battery sample to volts.
pub fn battery_voltage(level: u16) -> f32 {
    f32::from(level) * 3.6 / 1024.0
}

/// Verification progress of the current link.
enum Phase {
    NoLink,
    AwaitingResponse(Verifier),
    Verifying { pending: Vec<Vec<u8>> },
    Ready { sealer: Sealer, decoder: EventDecoder },
}

pub struct Session {
    pairing: PairingRecord,
    config: ManagerConfig,
    state: ConnectionState,
    phase: Phase,
    unpaired: bool,
    battery_level: Option<u16>,
    press_count: u32,
    filter: EventFilter,
    /// Bumped on every `OpenLink`; verification results from older links are dropped.
    epoch: u64,
    reconnect_after_teardown: bool,
    /// The failure that started the current teardown was already notified;
    /// the closing link-down completes it silently.
    teardown_reported: bool,
    /// Per link: a replayed burst must be acknowledged again.
    last_acked: Option<u32>,
}

impl Session {
    pub fn new(pairing: PairingRecord, config: ManagerConfig) -> Self {
        let filter = config.default_trigger_mode.filter();
        Self {
            pairing,
            config,
            state: ConnectionState::Disconnected,
            phase: Phase::NoLink,
            unpaired: false,
            battery_level: None,
            press_count: 0,
            filter,
            epoch: 0,
            reconnect_after_teardown: false,
            teardown_reported: false,
            last_acked: None,
        }
    }

    pub fn id(&self) -> ButtonId {
        self.pairing.identity.id
    }

    pub fn address(&self) -> BdAddr {
        self.pairing.identity.address
    }

    pub fn identity(&self) -> &ButtonIdentity {
        &self.pairing.identity
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Verified and able to deliver events. Only ever true while `Connected`.
    pub fn is_ready(&self) -> bool {
        matches!(self.phase, Phase::Ready { .. })
    }

    pub fn is_unpaired(&self) -> bool {
        self.unpaired
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn filter(&self) -> EventFilter {
        self.filter
    }

    pub fn status(&self) -> ButtonStatus {
        ButtonStatus {
            identity: self.pairing.identity.clone(),
            state: self.state,
            ready: self.is_ready(),
            unpaired: self.unpaired,
            battery_level: self.battery_level,
            press_count: self.press_count,
            filter: self.filter,
        }
    }

    /// Start a pending connection. Stays `Connecting` until the button is in
    /// range or [`Session::disconnect`] cancels it.
    pub fn connect(&mut self) -> Vec<SessionAction> {
        if self.unpaired {
            info!(button = %self.id(), "Connect refused: button is unpaired");
            return vec![SessionAction::Notify(Notification::ConnectFailed(
                ButtonError::Unpaired,
            ))];
        }
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => vec![],
            ConnectionState::Disconnecting => {
                self.reconnect_after_teardown = true;
                vec![]
            }
            ConnectionState::Disconnected => self.open_link(),
        }
    }

    /// Tear down the link or cancel a pending connection.
    pub fn disconnect(&mut self) -> Vec<SessionAction> {
        self.reconnect_after_teardown = false;
        match self.state {
            ConnectionState::Disconnected | ConnectionState::Disconnecting => vec![],
            ConnectionState::Connecting => {
                self.set_state(ConnectionState::Disconnecting);
                self.drop_link();
                self.set_state(ConnectionState::Disconnected);
                vec![SessionAction::CloseLink(self.address())]
            }
            ConnectionState::Connected => {
                self.drop_link();
                self.teardown_reported = false;
                self.set_state(ConnectionState::Disconnecting);
                vec![SessionAction::CloseLink(self.address())]
            }
        }
    }

    pub fn on_link_up(&mut self) -> Vec<SessionAction> {
        match self.state {
            ConnectionState::Connecting => {}
            ConnectionState::Disconnected => {
                debug!(button = %self.id(), "Link up with no pending connection, closing");
                return vec![SessionAction::CloseLink(self.address())];
            }
            ConnectionState::Connected | ConnectionState::Disconnecting => {
                debug!(button = %self.id(), state = ?self.state, "Ignoring link up");
                return vec![];
            }
        }

        self.set_state(ConnectionState::Connected);
        let (verifier, request) = Verifier::start(&self.pairing);
        let frame = match wire::encode_frame(&request) {
            Ok(frame) => frame,
            Err(e) => return self.fail_verification(VerificationError::Malformed(e.to_string())),
        };
        self.phase = Phase::AwaitingResponse(verifier);
        vec![
            SessionAction::Notify(Notification::Connected),
            SessionAction::Send(self.address(), frame),
        ]
    }

    /// A frame arrived on the current link.
    pub fn on_frame(&mut self, bytes: &[u8]) -> Vec<SessionAction> {
        if self.state != ConnectionState::Connected {
            debug!(button = %self.id(), state = ?self.state, "Dropping frame outside a connection");
            return vec![];
        }
        match std::mem::replace(&mut self.phase, Phase::NoLink) {
            Phase::NoLink => vec![],
            Phase::AwaitingResponse(verifier) => self.on_verify_frame(verifier, bytes),
            Phase::Verifying { mut pending } => {
                if pending.len() >= self.config.max_pending_frames {
                    return self.protocol_violation("too many frames before verification");
                }
                pending.push(bytes.to_vec());
                self.phase = Phase::Verifying { pending };
                vec![]
            }
            phase @ Phase::Ready { .. } => {
                self.phase = phase;
                self.deliver(bytes)
            }
        }
    }

    fn on_verify_frame(&mut self, verifier: Verifier, bytes: &[u8]) -> Vec<SessionAction> {
        let (msg, consumed) = match wire::decode_frame(bytes) {
            Ok(decoded) => decoded,
            Err(e) => return self.fail_verification(VerificationError::Malformed(e.to_string())),
        };
        match msg {
            Message::VerifyRejected { reason } => {
                warn!(button = %self.id(), ?reason, "Button rejected the pairing");
                self.on_unpaired(Some(reason))
            }
            response @ Message::VerifyResponse { .. } => {
                let mut pending = Vec::new();
                if consumed < bytes.len() {
                    pending.push(bytes[consumed..].to_vec());
                }
                self.phase = Phase::Verifying { pending };
                debug!(button = %self.id(), epoch = self.epoch, "Verification response received");
                vec![SessionAction::Verify(VerifyJob::new(
                    self.epoch, verifier, response,
                ))]
            }
            _ => self.fail_verification(VerificationError::UnexpectedMessage),
        }
    }

    /// Result of a [`VerifyJob`]. Results for a link that is gone are ignored.
    pub fn on_verification_complete(
        &mut self,
        epoch: u64,
        result: Result<Verified, VerificationError>,
    ) -> Vec<SessionAction> {
        let awaiting = matches!(self.phase, Phase::Verifying { .. });
        if epoch != self.epoch || !awaiting || self.state != ConnectionState::Connected {
            debug!(button = %self.id(), epoch, current = self.epoch, "Discarding stale verification result");
            return vec![];
        }
        let verified = match result {
            Ok(verified) => verified,
            Err(e) => return self.fail_verification(e),
        };
        let pending = match std::mem::replace(&mut self.phase, Phase::NoLink) {
            Phase::Verifying { pending } => pending,
            _ => Vec::new(),
        };

        self.pairing.identity.firmware_revision = verified.firmware_revision;
        let SessionKeys { sealer, opener } = verified.keys;
        let decoder = EventDecoder::new(opener, self.filter, self.config.max_queued_events);
        self.phase = Phase::Ready { sealer, decoder };
        info!(button = %self.id(), firmware = verified.firmware_revision, "Button ready");

        let mut actions = vec![SessionAction::Notify(Notification::Ready)];
        actions.extend(self.send_sealed(&Message::SetTriggerMode {
            filter: self.filter,
        }));
        for frame in pending {
            if !self.is_ready() {
                break;
            }
            actions.extend(self.deliver(&frame));
        }
        actions
    }

    /// The radio reports the link is gone. While `Disconnecting` this completes
    /// the teardown; a new link is only opened after it.
    pub fn on_link_down(&mut self, cause: DisconnectCause) -> Vec<SessionAction> {
        let cause = match self.state {
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                debug!(button = %self.id(), state = ?self.state, %cause, "Ignoring link down");
                return vec![];
            }
            ConnectionState::Disconnecting => DisconnectCause::LocalRequest,
            ConnectionState::Connected => cause,
        };
        self.drop_link();
        self.set_state(ConnectionState::Disconnected);
        let mut actions = Vec::new();
        if std::mem::take(&mut self.teardown_reported) {
            debug!(button = %self.id(), "Teardown complete");
        } else {
            if cause.is_expected() {
                info!(button = %self.id(), %cause, "Disconnected");
            } else {
                warn!(button = %self.id(), %cause, "Link lost");
            }
            actions.push(SessionAction::Notify(Notification::Disconnected(Some(cause))));
        }
        if std::mem::take(&mut self.reconnect_after_teardown) && !self.unpaired {
            actions.extend(self.open_link());
        }
        actions
    }

    /// The radio could not establish or keep the link.
    pub fn on_link_failed(&mut self, error: TransportError) -> Vec<SessionAction> {
        match self.state {
            ConnectionState::Connecting => {
                warn!(button = %self.id(), %error, "Connection attempt failed");
                self.drop_link();
                self.set_state(ConnectionState::Disconnected);
                vec![SessionAction::Notify(Notification::ConnectFailed(
                    ButtonError::Transport(error),
                ))]
            }
            ConnectionState::Connected if !self.is_ready() => {
                warn!(button = %self.id(), %error, "Link failed before the button was ready");
                self.drop_link();
                self.set_state(ConnectionState::Disconnected);
                vec![SessionAction::Notify(Notification::ConnectFailed(
                    ButtonError::Transport(error),
                ))]
            }
            ConnectionState::Connected | ConnectionState::Disconnecting => {
                self.on_link_down(DisconnectCause::Transport(error))
            }
            ConnectionState::Disconnected => vec![],
        }
    }

    /// The pairing was revoked, by the button or by the backend. Permanent.
    pub fn on_unpaired(&mut self, reason: Option<RevokeReason>) -> Vec<SessionAction> {
        if self.unpaired {
            return vec![];
        }
        self.unpaired = true;
        self.reconnect_after_teardown = false;
        self.teardown_reported = false;
        let mut actions = Vec::new();
        if self.state != ConnectionState::Disconnected {
            actions.push(SessionAction::CloseLink(self.address()));
        }
        self.drop_link();
        self.set_state(ConnectionState::Disconnected);
        warn!(button = %self.id(), ?reason, "Button unpaired");
        actions.push(SessionAction::Notify(Notification::Unpaired(reason)));
        actions
    }

    /// Change which categories are reported. Pushed to the button when ready,
    /// otherwise on the next verification.
    pub fn set_trigger_mode(&mut self, filter: EventFilter) -> Vec<SessionAction> {
        self.filter = filter;
        if let Phase::Ready { decoder, .. } = &mut self.phase {
            decoder.set_filter(filter);
            return self.send_sealed(&Message::SetTriggerMode { filter });
        }
        vec![]
    }

    pub fn set_nickname(&mut self, nickname: Option<String>) {
        self.pairing.identity.nickname = nickname;
    }

    fn open_link(&mut self) -> Vec<SessionAction> {
        self.epoch += 1;
        self.teardown_reported = false;
        self.set_state(ConnectionState::Connecting);
        vec![SessionAction::OpenLink(self.address())]
    }

    /// Forget everything tied to the current link. Keys and verifier state are
    /// dropped here, which zeroizes them.
    fn drop_link(&mut self) {
        self.phase = Phase::NoLink;
        self.last_acked = None;
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!(button = %self.id(), from = ?self.state, to = ?state, "State transition");
            self.state = state;
        }
    }

    /// Close the link and wait in `Disconnecting` for its link-down, so a late
    /// callback from this link cannot hit the next one.
    fn begin_teardown(&mut self) {
        self.drop_link();
        self.teardown_reported = true;
        self.set_state(ConnectionState::Disconnecting);
    }

    fn fail_verification(&mut self, error: VerificationError) -> Vec<SessionAction> {
        warn!(button = %self.id(), %error, "Verification failed");
        self.begin_teardown();
        vec![
            SessionAction::CloseLink(self.address()),
            SessionAction::Notify(Notification::ConnectFailed(ButtonError::Verification(
                error,
            ))),
        ]
    }

    fn protocol_violation(&mut self, reason: &str) -> Vec<SessionAction> {
        let cause = DisconnectCause::Protocol(reason.to_string());
        warn!(button = %self.id(), %cause, "Closing link");
        let notification = if self.is_ready() {
            Notification::Disconnected(Some(cause))
        } else {
            Notification::ConnectFailed(ButtonError::Verification(VerificationError::Malformed(
                reason.to_string(),
            )))
        };
        self.begin_teardown();
        vec![
            SessionAction::CloseLink(self.address()),
            SessionAction::Notify(notification),
        ]
    }

    fn send_sealed(&mut self, msg: &Message) -> Vec<SessionAction> {
        let Phase::Ready { sealer, .. } = &mut self.phase else {
            return vec![];
        };
        match sealer.seal(msg) {
            Ok(frame) => vec![SessionAction::Send(self.pairing.identity.address, frame)],
            Err(e) => self.protocol_violation(&e.to_string()),
        }
    }

    fn deliver(&mut self, bytes: &[u8]) -> Vec<SessionAction> {
        let Phase::Ready { decoder, .. } = &mut self.phase else {
            return vec![];
        };
        let decoded = match decoder.decode(bytes) {
            Ok(decoded) => decoded,
            Err(e) => return self.protocol_violation(&e.to_string()),
        };
        let mut actions = Vec::with_capacity(decoded.len() + 1);
        for item in decoded {
            match item {
                Decoded::Button(event) => {
                    self.press_count = event.press_count;
                    debug!(button = %self.id(), kind = ?event.kind, queued = event.queued, age = event.age_secs, "Button event");
                    actions.push(SessionAction::Notify(Notification::Button(event)));
                }
                Decoded::Battery(level) => {
                    self.battery_level = Some(level);
                    actions.push(SessionAction::Notify(Notification::BatteryLevel(level)));
                }
                Decoded::Revoked(reason) => {
                    actions.extend(self.on_unpaired(Some(reason)));
                    return actions;
                }
            }
        }
        actions.extend(self.ack());
        actions
    }

    /// Acknowledge everything consumed once the burst is over.
    fn ack(&mut self) -> Vec<SessionAction> {
        if !self.config.ack_events {
            return vec![];
        }
        let Phase::Ready { decoder, .. } = &self.phase else {
            return vec![];
        };
        if decoder.is_draining() {
            return vec![];
        }
        match decoder.highest_seq() {
            Some(seq) if self.last_acked.map_or(true, |acked| seq > acked) => {
                self.last_acked = Some(seq);
                self.send_sealed(&Message::AckEvents { through_seq: seq })
            }
            _ => vec![],
        }
    }
}
