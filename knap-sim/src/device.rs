//! Firmware model of a button: holds the pairing secret, queues presses while
//! no host is connected and replays them on the next verified link.

use std::collections::VecDeque;

use knap_core::identity::{BdAddr, ButtonId, ButtonIdentity, PairingRecord, PairingSecret};
use knap_core::protocol::{EventFilter, EventKind, Message, RevokeReason};
use knap_core::verify::{Responder, SessionKeys};
use knap_core::wire::{self, FrameDecodeError};
use tracing::{debug, warn};

/// Events the button keeps until a host acknowledges them.
const QUEUE_CAPACITY: usize = 256;
/// Raw battery sample reported on every connection (about 3.0 V).
const FRESH_BATTERY: u16 = 853;

#[derive(Debug, Clone, Copy)]
struct Stored {
    seq: u32,
    kind: EventKind,
    timestamp_ms: u64,
}

pub struct SimButton {
    address: BdAddr,
    serial_number: String,
    firmware_revision: u32,
    secret: Option<PairingSecret>,
    keys: Option<SessionKeys>,
    unacked: VecDeque<Stored>,
    clock_ms: u64,
    next_seq: u32,
    press_count: u32,
    battery_level: u16,
    filter: EventFilter,
    linked: bool,
}

impl SimButton {
    /// A factory-fresh button paired with this host. Returns the record the host stores.
    pub fn pair(address: BdAddr, name: &str) -> (Self, PairingRecord) {
        let secret = PairingSecret::generate();
        let serial_number = format!("SIM-{:02X}{:02X}", address.as_bytes()[4], address.as_bytes()[5]);
        let firmware_revision = 3;
        let identity = ButtonIdentity {
            id: ButtonId::generate(),
            uuid: uuid_hex(&address),
            address,
            name: Some(name.to_string()),
            nickname: None,
            serial_number: serial_number.clone(),
            firmware_revision,
        };
        let button = Self {
            address,
            serial_number,
            firmware_revision,
            secret: Some(secret.clone()),
            keys: None,
            unacked: VecDeque::new(),
            clock_ms: 0,
            next_seq: 1,
            press_count: 0,
            battery_level: FRESH_BATTERY,
            filter: EventFilter::all(),
            linked: false,
        };
        (button, PairingRecord::new(identity, secret))
    }

    pub fn address(&self) -> BdAddr {
        self.address
    }

    pub fn press_count(&self) -> u32 {
        self.press_count
    }

    /// Events not yet acknowledged by any host.
    pub fn unacked(&self) -> usize {
        self.unacked.len()
    }

    pub fn is_verified(&self) -> bool {
        self.keys.is_some()
    }

    pub fn set_battery_level(&mut self, level: u16) {
        self.battery_level = level;
    }

    pub fn advance(&mut self, ms: u64) {
        self.clock_ms += ms;
    }

    /// A physical action. Returns the frame to send if a verified host is listening.
    pub fn press(&mut self, kind: EventKind) -> Option<Vec<u8>> {
        self.press_count += 1;
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        if self.unacked.len() == QUEUE_CAPACITY {
            self.unacked.pop_front();
        }
        self.unacked.push_back(Stored {
            seq,
            kind,
            timestamp_ms: self.clock_ms,
        });
        if self.keys.is_none() || !self.filter.allows(kind) {
            return None;
        }
        let msg = Message::ButtonEvent {
            seq,
            kind,
            queued: false,
            timestamp_ms: self.clock_ms,
            device_time_ms: self.clock_ms,
            press_count: self.press_count,
        };
        self.seal(&msg)
    }

    /// Forget the pairing. A connected host is told before the keys go away.
    pub fn factory_reset(&mut self) -> Option<Vec<u8>> {
        let notice = self.seal(&Message::PairingRevoked {
            reason: RevokeReason::FactoryReset,
        });
        self.secret = None;
        self.keys = None;
        self.unacked.clear();
        self.press_count = 0;
        notice
    }

    pub fn on_link_up(&mut self) {
        self.linked = true;
        self.keys = None;
    }

    pub fn on_link_down(&mut self) {
        self.linked = false;
        self.keys = None;
    }

    /// Handle one inbound frame and return the frames sent in reply.
    pub fn receive(&mut self, frame: &[u8]) -> Vec<Vec<u8>> {
        if !self.linked {
            return vec![];
        }
        if self.keys.is_some() {
            return self.receive_sealed(frame);
        }
        let request = match wire::decode_frame(frame) {
            Ok((msg, _)) => msg,
            Err(e) => {
                warn!(address = %self.address, error = %e, "Unreadable frame before verification");
                return vec![];
            }
        };
        let Some(secret) = self.secret.clone() else {
            let rejection = Message::VerifyRejected {
                reason: RevokeReason::FactoryReset,
            };
            return wire::encode_frame(&rejection).into_iter().collect();
        };
        let responder = Responder {
            address: self.address,
            serial_number: self.serial_number.clone(),
            firmware_revision: self.firmware_revision,
            secret,
        };
        let (response, keys) = match responder.respond(&request) {
            Ok(answer) => answer,
            Err(e) => {
                warn!(address = %self.address, error = %e, "Verification request refused");
                return vec![];
            }
        };
        let mut out: Vec<Vec<u8>> = wire::encode_frame(&response).into_iter().collect();
        self.keys = Some(keys);
        out.extend(self.burst());
        out
    }

    /// Battery sample, every unacknowledged event marked queued, then the end marker.
    fn burst(&mut self) -> Vec<Vec<u8>> {
        let mut msgs = vec![Message::BatteryStatus {
            level: self.battery_level,
        }];
        let now = self.clock_ms;
        let press_count = self.press_count;
        msgs.extend(
            self.unacked
                .iter()
                .filter(|e| self.filter.allows(e.kind))
                .map(|e| Message::ButtonEvent {
                    seq: e.seq,
                    kind: e.kind,
                    queued: true,
                    timestamp_ms: e.timestamp_ms,
                    device_time_ms: now,
                    press_count,
                }),
        );
        msgs.push(Message::QueueDrained);
        debug!(address = %self.address, queued = msgs.len() - 2, "Replaying queue");
        msgs.iter().filter_map(|m| self.seal(m)).collect()
    }

    fn receive_sealed(&mut self, frame: &[u8]) -> Vec<Vec<u8>> {
        let Some(keys) = self.keys.as_mut() else {
            return vec![];
        };
        let mut offset = 0;
        while offset < frame.len() {
            let (msg, consumed) = match keys.opener.open(&frame[offset..]) {
                Ok(opened) => opened,
                Err(FrameDecodeError::NeedMore) => break,
                Err(e) => {
                    warn!(address = %self.address, error = %e, "Dropping bad host frame");
                    break;
                }
            };
            offset += consumed;
            match msg {
                Message::SetTriggerMode { filter } => self.filter = filter,
                Message::AckEvents { through_seq } => {
                    self.unacked.retain(|e| e.seq > through_seq);
                }
                other => debug!(address = %self.address, ?other, "Ignoring host message"),
            }
        }
        vec![]
    }

    fn seal(&mut self, msg: &Message) -> Option<Vec<u8>> {
        let keys = self.keys.as_mut()?;
        match keys.sealer.seal(msg) {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!(address = %self.address, error = %e, "Seal failed");
                None
            }
        }
    }
}

fn uuid_hex(address: &BdAddr) -> String {
    let mut out = String::from("00000000000000000000");
    for b in address.as_bytes() {
        out.push_str(&format!("{b:02x}"));
    }
    out
}
