//! In-process radio connecting the manager to simulated buttons.

use std::collections::HashMap;
use std::sync::Arc;

use knap_core::identity::BdAddr;
use knap_core::protocol::EventKind;
use knap_core::transport::{DisconnectCause, LinkEvent, Transport, TransportError, TransportEvent};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::device::SimButton;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Idle,
    /// Requested while the button was out of range; completes when it returns.
    Pending,
    Up,
}

struct Slot {
    device: SimButton,
    in_range: bool,
    link: Link,
}

struct Radio {
    slots: HashMap<BdAddr, Slot>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl Radio {
    fn emit(&self, address: BdAddr, kind: LinkEvent) {
        let _ = self.events.send(TransportEvent::new(address, kind));
    }

    fn emit_frames(&self, address: BdAddr, frames: Vec<Vec<u8>>) {
        for frame in frames {
            self.emit(address, LinkEvent::Frame(frame));
        }
    }

    fn slot(&mut self, address: BdAddr) -> Result<&mut Slot, TransportError> {
        self.slots
            .get_mut(&address)
            .ok_or_else(|| TransportError::Unavailable(format!("no button at {address}")))
    }
}

/// Loopback [`Transport`]. Cheap to clone; clones drive the same radio.
#[derive(Clone)]
pub struct LoopbackTransport {
    radio: Arc<Mutex<Radio>>,
}

impl LoopbackTransport {
    /// Create the radio and the stream of callbacks to feed to
    /// [`knap_core::ButtonManager::pump`].
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let radio = Radio {
            slots: HashMap::new(),
            events,
        };
        (
            Self {
                radio: Arc::new(Mutex::new(radio)),
            },
            rx,
        )
    }

    /// Place a button on the air, in range.
    pub fn add_button(&self, device: SimButton) {
        let address = device.address();
        self.radio.lock().slots.insert(
            address,
            Slot {
                device,
                in_range: true,
                link: Link::Idle,
            },
        );
    }

    /// Move a button in or out of range. Leaving drops an open link; returning
    /// completes a pending one.
    pub fn set_in_range(&self, address: BdAddr, in_range: bool) {
        let mut radio = self.radio.lock();
        let Some(slot) = radio.slots.get_mut(&address) else {
            return;
        };
        slot.in_range = in_range;
        let event = match (in_range, slot.link) {
            (false, Link::Up) => {
                slot.device.on_link_down();
                slot.link = Link::Idle;
                Some(LinkEvent::Down(DisconnectCause::OutOfRange))
            }
            (true, Link::Pending) => {
                slot.device.on_link_up();
                slot.link = Link::Up;
                Some(LinkEvent::Up)
            }
            _ => None,
        };
        if let Some(event) = event {
            debug!(%address, in_range, "Range change");
            radio.emit(address, event);
        }
    }

    /// Simulate a press on the button at `address`.
    pub fn press(&self, address: BdAddr, kind: EventKind) {
        let mut radio = self.radio.lock();
        let frame = match radio.slots.get_mut(&address) {
            Some(slot) => slot.device.press(kind),
            None => return,
        };
        if let Some(frame) = frame {
            radio.emit(address, LinkEvent::Frame(frame));
        }
    }

    pub fn factory_reset(&self, address: BdAddr) {
        let mut radio = self.radio.lock();
        let frame = match radio.slots.get_mut(&address) {
            Some(slot) => slot.device.factory_reset(),
            None => return,
        };
        if let Some(frame) = frame {
            radio.emit(address, LinkEvent::Frame(frame));
        }
    }

    /// Advance every button's clock.
    pub fn advance(&self, ms: u64) {
        for slot in self.radio.lock().slots.values_mut() {
            slot.device.advance(ms);
        }
    }

    /// Inspect or tweak a button.
    pub fn with_button<R>(&self, address: BdAddr, f: impl FnOnce(&mut SimButton) -> R) -> Option<R> {
        self.radio
            .lock()
            .slots
            .get_mut(&address)
            .map(|slot| f(&mut slot.device))
    }

    pub fn addresses(&self) -> Vec<BdAddr> {
        self.radio.lock().slots.keys().copied().collect()
    }
}

impl Transport for LoopbackTransport {
    fn open_link(&self, address: BdAddr) -> Result<(), TransportError> {
        let mut radio = self.radio.lock();
        let slot = radio.slot(address)?;
        if slot.link != Link::Idle {
            return Ok(());
        }
        if !slot.in_range {
            slot.link = Link::Pending;
            debug!(%address, "Link pending until button is in range");
            return Ok(());
        }
        slot.device.on_link_up();
        slot.link = Link::Up;
        radio.emit(address, LinkEvent::Up);
        Ok(())
    }

    fn close_link(&self, address: BdAddr) -> Result<(), TransportError> {
        let mut radio = self.radio.lock();
        let slot = radio.slot(address)?;
        let was = std::mem::replace(&mut slot.link, Link::Idle);
        if was == Link::Up {
            slot.device.on_link_down();
            radio.emit(address, LinkEvent::Down(DisconnectCause::LocalRequest));
        }
        Ok(())
    }

    fn send(&self, address: BdAddr, frame: Vec<u8>) -> Result<(), TransportError> {
        let mut radio = self.radio.lock();
        let slot = radio.slot(address)?;
        if slot.link != Link::Up {
            return Err(TransportError::SendFailed(format!("no link to {address}")));
        }
        let replies = slot.device.receive(&frame);
        radio.emit_frames(address, replies);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_link_completes_when_in_range() {
        let (radio, mut rx) = LoopbackTransport::new();
        let addr = BdAddr::new([0, 0, 0, 0, 0, 9]);
        let (device, _) = SimButton::pair(addr, "t");
        radio.add_button(device);
        radio.set_in_range(addr, false);
        radio.open_link(addr).unwrap();
        assert!(rx.try_recv().is_err());
        radio.set_in_range(addr, true);
        assert_eq!(rx.try_recv().unwrap().kind, LinkEvent::Up);
        radio.set_in_range(addr, false);
        assert_eq!(
            rx.try_recv().unwrap().kind,
            LinkEvent::Down(DisconnectCause::OutOfRange)
        );
    }

    #[test]
    fn unknown_address_is_unavailable() {
        let (radio, _rx) = LoopbackTransport::new();
        assert!(matches!(
            radio.open_link(BdAddr::new([1; 6])),
            Err(TransportError::Unavailable(_))
        ));
    }

    #[test]
    fn send_without_link_fails() {
        let (radio, _rx) = LoopbackTransport::new();
        let addr = BdAddr::new([0, 0, 0, 0, 0, 10]);
        radio.add_button(SimButton::pair(addr, "t").0);
        assert!(matches!(
            radio.send(addr, vec![0; 4]),
            Err(TransportError::SendFailed(_))
        ));
    }
}
