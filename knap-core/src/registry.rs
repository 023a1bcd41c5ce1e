//! Device registry: owns one session actor per paired button and routes
//! transport events to them by address.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::ManagerConfig;
use crate::error::ButtonError;
use crate::identity::{BdAddr, ButtonId, PairingRecord};
use crate::protocol::{EventFilter, RevokeReason};
use crate::session::{ButtonStatus, Notification, Session, SessionAction};
use crate::transport::{DisconnectCause, LinkEvent, Transport, TransportEvent};
use crate::verify::{VerificationError, Verified};

/// One notification, tagged with the button it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerEvent {
    pub button: ButtonId,
    pub notification: Notification,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("button {0} is already registered")]
    DuplicateId(ButtonId),
    #[error("address {0} is already registered")]
    DuplicateAddress(BdAddr),
}

enum SessionInput {
    Connect,
    Disconnect,
    Link(LinkEvent),
    VerificationDone {
        epoch: u64,
        result: Result<Verified, VerificationError>,
    },
    SetFilter(EventFilter),
    SetNickname(Option<String>),
    Unpair(Option<RevokeReason>),
    Shutdown,
}

/// Registry-side view of a running session actor.
struct SessionEntry {
    address: BdAddr,
    inbox: mpsc::UnboundedSender<SessionInput>,
    status: watch::Receiver<ButtonStatus>,
    removed: Arc<AtomicBool>,
}

impl SessionEntry {
    fn handle(&self, id: ButtonId) -> ButtonHandle {
        ButtonHandle {
            id,
            inbox: self.inbox.clone(),
            status: self.status.clone(),
            removed: self.removed.clone(),
        }
    }
}

#[derive(Default)]
struct Maps {
    sessions: HashMap<ButtonId, SessionEntry>,
    by_address: HashMap<BdAddr, ButtonId>,
}

/// Registry of paired buttons. Cheap to clone; clones share the same sessions.
///
/// Must be used from within a Tokio runtime: every added button gets its own task.
#[derive(Clone)]
pub struct ButtonManager {
    transport: Arc<dyn Transport>,
    config: ManagerConfig,
    maps: Arc<RwLock<Maps>>,
    events: mpsc::UnboundedSender<ManagerEvent>,
}

impl ButtonManager {
    /// Create a manager and the receiver every notification is delivered on.
    /// Notifications of one button arrive in the order its session produced them.
    pub fn new(
        transport: Arc<dyn Transport>,
        config: ManagerConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ManagerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let manager = Self {
            transport,
            config,
            maps: Arc::new(RwLock::new(Maps::default())),
            events,
        };
        (manager, rx)
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Register a paired button and start its session. The button starts disconnected.
    pub fn add_button(&self, pairing: PairingRecord) -> Result<ButtonHandle, RegistryError> {
        let id = pairing.identity.id;
        let address = pairing.identity.address;
        let mut maps = self.maps.write();
        if maps.sessions.contains_key(&id) {
            return Err(RegistryError::DuplicateId(id));
        }
        if maps.by_address.contains_key(&address) {
            return Err(RegistryError::DuplicateAddress(address));
        }

        let session = Session::new(pairing, self.config.clone());
        let (status_tx, status_rx) = watch::channel(session.status());
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let actor = SessionActor {
            session,
            transport: self.transport.clone(),
            events: self.events.clone(),
            status: status_tx,
            inbox: inbox_tx.downgrade(),
        };
        tokio::spawn(actor.run(inbox_rx));

        let entry = SessionEntry {
            address,
            inbox: inbox_tx,
            status: status_rx,
            removed: Arc::new(AtomicBool::new(false)),
        };
        let handle = entry.handle(id);
        maps.sessions.insert(id, entry);
        maps.by_address.insert(address, id);
        info!(button = %id, %address, "Button added");
        Ok(handle)
    }

    /// Tear down the button's link and forget it. Outstanding handles report
    /// [`ButtonError::NotFound`] from now on.
    pub fn remove_button(&self, id: ButtonId) -> Result<(), ButtonError> {
        let entry = {
            let mut maps = self.maps.write();
            let entry = maps.sessions.remove(&id).ok_or(ButtonError::NotFound)?;
            maps.by_address.remove(&entry.address);
            entry
        };
        entry.removed.store(true, Ordering::SeqCst);
        let _ = entry.inbox.send(SessionInput::Shutdown);
        info!(button = %id, "Button removed");
        Ok(())
    }

    pub fn button(&self, id: ButtonId) -> Option<ButtonHandle> {
        self.maps.read().sessions.get(&id).map(|e| e.handle(id))
    }

    pub fn button_by_address(&self, address: BdAddr) -> Option<ButtonHandle> {
        let maps = self.maps.read();
        let id = maps.by_address.get(&address)?;
        maps.sessions.get(id).map(|e| e.handle(*id))
    }

    pub fn buttons(&self) -> Vec<ButtonHandle> {
        self.maps
            .read()
            .sessions
            .iter()
            .map(|(id, e)| e.handle(*id))
            .collect()
    }

    /// Route a radio callback to the session owning its address. Events for
    /// unknown addresses are dropped.
    pub fn handle_transport_event(&self, event: TransportEvent) {
        let inbox = {
            let maps = self.maps.read();
            maps.by_address
                .get(&event.address)
                .and_then(|id| maps.sessions.get(id))
                .map(|e| e.inbox.clone())
        };
        match inbox {
            Some(inbox) => {
                let _ = inbox.send(SessionInput::Link(event.kind));
            }
            None => debug!(address = %event.address, "Transport event for unknown address"),
        }
    }

    /// Revocation learned out of band, e.g. from a backend.
    pub fn mark_unpaired(&self, id: ButtonId, reason: Option<RevokeReason>) -> Result<(), ButtonError> {
        let maps = self.maps.read();
        let entry = maps.sessions.get(&id).ok_or(ButtonError::NotFound)?;
        entry
            .inbox
            .send(SessionInput::Unpair(reason))
            .map_err(|_| ButtonError::NotFound)
    }

    /// Feed transport events from `rx` until every sender is gone.
    pub async fn pump(&self, mut rx: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = rx.recv().await {
            self.handle_transport_event(event);
        }
        debug!("Transport event stream closed");
    }
}

/// Caller-side handle to one button. Operations are queued to the button's
/// session and return immediately; outcomes arrive as notifications.
#[derive(Clone)]
pub struct ButtonHandle {
    id: ButtonId,
    inbox: mpsc::UnboundedSender<SessionInput>,
    status: watch::Receiver<ButtonStatus>,
    removed: Arc<AtomicBool>,
}

impl std::fmt::Debug for ButtonHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ButtonHandle")
            .field("id", &self.id)
            .field("removed", &self.removed.load(Ordering::Relaxed))
            .finish()
    }
}

impl ButtonHandle {
    pub fn id(&self) -> ButtonId {
        self.id
    }

    /// Start a pending connection. Fails fast if the button is known to be unpaired.
    pub fn connect(&self) -> Result<(), ButtonError> {
        if self.status()?.unpaired {
            return Err(ButtonError::Unpaired);
        }
        self.send(SessionInput::Connect)
    }

    pub fn disconnect(&self) -> Result<(), ButtonError> {
        self.send(SessionInput::Disconnect)
    }

    pub fn set_trigger_mode(&self, filter: impl Into<EventFilter>) -> Result<(), ButtonError> {
        self.send(SessionInput::SetFilter(filter.into()))
    }

    pub fn set_nickname(&self, nickname: Option<String>) -> Result<(), ButtonError> {
        self.send(SessionInput::SetNickname(nickname))
    }

    /// Latest published snapshot; may trail inputs still queued.
    pub fn status(&self) -> Result<ButtonStatus, ButtonError> {
        if self.removed.load(Ordering::SeqCst) {
            return Err(ButtonError::NotFound);
        }
        Ok(self.status.borrow().clone())
    }

    /// Wait until the published status satisfies `f`.
    pub async fn wait_for<F>(&self, mut f: F) -> Result<ButtonStatus, ButtonError>
    where
        F: FnMut(&ButtonStatus) -> bool,
    {
        let mut rx = self.status.clone();
        let status = rx
            .wait_for(|s| f(s))
            .await
            .map(|s| ButtonStatus::clone(&s))
            .map_err(|_| ButtonError::NotFound)?;
        Ok(status)
    }

    fn send(&self, input: SessionInput) -> Result<(), ButtonError> {
        if self.removed.load(Ordering::SeqCst) {
            return Err(ButtonError::NotFound);
        }
        self.inbox.send(input).map_err(|_| ButtonError::NotFound)
    }
}

/// Task owning one [`Session`]. Every input is applied in arrival order and its
/// actions run to completion before the next input is read.
struct SessionActor {
    session: Session,
    transport: Arc<dyn Transport>,
    events: mpsc::UnboundedSender<ManagerEvent>,
    status: watch::Sender<ButtonStatus>,
    /// Weak so the actor does not keep its own inbox open.
    inbox: mpsc::WeakUnboundedSender<SessionInput>,
}

impl SessionActor {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<SessionInput>) {
        while let Some(input) = inbox.recv().await {
            let actions = match input {
                SessionInput::Connect => self.session.connect(),
                SessionInput::Disconnect => self.session.disconnect(),
                SessionInput::Link(LinkEvent::Up) => self.session.on_link_up(),
                SessionInput::Link(LinkEvent::Down(cause)) => self.session.on_link_down(cause),
                SessionInput::Link(LinkEvent::Failed(err)) => self.session.on_link_failed(err),
                SessionInput::Link(LinkEvent::Frame(bytes)) => self.session.on_frame(&bytes),
                SessionInput::VerificationDone { epoch, result } => {
                    self.session.on_verification_complete(epoch, result)
                }
                SessionInput::SetFilter(filter) => self.session.set_trigger_mode(filter),
                SessionInput::SetNickname(nickname) => {
                    self.session.set_nickname(nickname);
                    vec![]
                }
                SessionInput::Unpair(reason) => self.session.on_unpaired(reason),
                SessionInput::Shutdown => {
                    let actions = self.session.disconnect();
                    self.execute(actions);
                    break;
                }
            };
            self.execute(actions);
            self.status.send_replace(self.session.status());
        }
        debug!(button = %self.session.id(), "Session task stopped");
    }

    fn execute(&mut self, actions: Vec<SessionAction>) {
        let mut queue: VecDeque<SessionAction> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                SessionAction::OpenLink(address) => {
                    if let Err(e) = self.transport.open_link(address) {
                        queue.extend(self.session.on_link_failed(e));
                    }
                }
                SessionAction::CloseLink(address) => {
                    if let Err(e) = self.transport.close_link(address) {
                        warn!(button = %self.session.id(), %address, error = %e, "Close link failed");
                        // No link-down will follow; finish any teardown here.
                        queue.extend(self.session.on_link_down(DisconnectCause::Transport(e)));
                    }
                }
                SessionAction::Send(address, bytes) => {
                    if let Err(e) = self.transport.send(address, bytes) {
                        queue.extend(self.session.on_link_failed(e));
                    }
                }
                SessionAction::Verify(job) => {
                    let Some(inbox) = self.inbox.upgrade() else {
                        continue;
                    };
                    tokio::task::spawn_blocking(move || {
                        let epoch = job.epoch();
                        let result = job.run();
                        let _ = inbox.send(SessionInput::VerificationDone { epoch, result });
                    });
                }
                SessionAction::Notify(notification) => {
                    let _ = self.events.send(ManagerEvent {
                        button: self.session.id(),
                        notification,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{ButtonIdentity, PairingSecret};
    use crate::protocol::TriggerMode;
    use crate::session::ConnectionState;
    use crate::transport::TransportError;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct CountingTransport {
        opens: AtomicUsize,
        closes: AtomicUsize,
        sends: AtomicUsize,
    }

    impl CountingTransport {
        fn calls(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
                + self.closes.load(Ordering::SeqCst)
                + self.sends.load(Ordering::SeqCst)
        }
    }

    impl Transport for CountingTransport {
        fn open_link(&self, _: BdAddr) -> Result<(), TransportError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn close_link(&self, _: BdAddr) -> Result<(), TransportError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn send(&self, _: BdAddr, _: Vec<u8>) -> Result<(), TransportError> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn pairing(last: u8) -> PairingRecord {
        PairingRecord::new(
            ButtonIdentity {
                id: ButtonId::generate(),
                uuid: format!("{last:032x}"),
                address: BdAddr::new([0x00, 0x80, 0xe4, 0xda, 0x10, last]),
                name: None,
                nickname: None,
                serial_number: format!("BG00-R{last:05}"),
                firmware_revision: 1,
            },
            PairingSecret::generate(),
        )
    }

    fn manager() -> (
        ButtonManager,
        mpsc::UnboundedReceiver<ManagerEvent>,
        Arc<CountingTransport>,
    ) {
        let transport = Arc::new(CountingTransport::default());
        let (m, rx) = ButtonManager::new(transport.clone(), ManagerConfig::default());
        (m, rx, transport)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<ManagerEvent>) -> ManagerEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn duplicate_registrations_rejected() {
        let (m, _rx, _t) = manager();
        let p = pairing(1);
        let mut same_addr = pairing(1);
        same_addr.identity.id = ButtonId::generate();
        let id = p.identity.id;
        m.add_button(p.clone()).unwrap();
        assert_eq!(m.add_button(p).unwrap_err(), RegistryError::DuplicateId(id));
        assert!(matches!(
            m.add_button(same_addr),
            Err(RegistryError::DuplicateAddress(_))
        ));
        assert_eq!(m.buttons().len(), 1);
    }

    #[tokio::test]
    async fn unpaired_button_never_touches_transport() {
        let (m, mut rx, t) = manager();
        let h = m.add_button(pairing(2)).unwrap();
        m.mark_unpaired(h.id(), Some(RevokeReason::PairingRemoved))
            .unwrap();
        let ev = next(&mut rx).await;
        assert_eq!(
            ev.notification,
            Notification::Unpaired(Some(RevokeReason::PairingRemoved))
        );
        h.wait_for(|s| s.unpaired).await.unwrap();
        for _ in 0..3 {
            assert_eq!(h.connect(), Err(ButtonError::Unpaired));
        }
        assert_eq!(t.calls(), 0);
    }

    #[tokio::test]
    async fn link_events_route_by_address() {
        let (m, mut rx, t) = manager();
        let p = pairing(3);
        let addr = p.identity.address;
        let h = m.add_button(p).unwrap();
        h.connect().unwrap();
        h.wait_for(|s| s.state == ConnectionState::Connecting)
            .await
            .unwrap();
        assert_eq!(t.opens.load(Ordering::SeqCst), 1);

        m.handle_transport_event(TransportEvent::new(addr, LinkEvent::Up));
        assert_eq!(next(&mut rx).await.notification, Notification::Connected);
        // The verification request went out.
        h.wait_for(|s| s.state == ConnectionState::Connected)
            .await
            .unwrap();
        assert_eq!(t.sends.load(Ordering::SeqCst), 1);

        m.handle_transport_event(TransportEvent::new(
            addr,
            LinkEvent::Down(DisconnectCause::OutOfRange),
        ));
        assert_eq!(
            next(&mut rx).await.notification,
            Notification::Disconnected(Some(DisconnectCause::OutOfRange))
        );
        let status = h
            .wait_for(|s| s.state == ConnectionState::Disconnected)
            .await
            .unwrap();
        assert!(!status.ready);
    }

    #[tokio::test]
    async fn transport_refusal_reports_connect_failed() {
        struct Offline;
        impl Transport for Offline {
            fn open_link(&self, _: BdAddr) -> Result<(), TransportError> {
                Err(TransportError::Unavailable("radio off".into()))
            }
            fn close_link(&self, _: BdAddr) -> Result<(), TransportError> {
                Ok(())
            }
            fn send(&self, _: BdAddr, _: Vec<u8>) -> Result<(), TransportError> {
                Ok(())
            }
        }
        let (m, mut rx) = ButtonManager::new(Arc::new(Offline), ManagerConfig::default());
        let h = m.add_button(pairing(4)).unwrap();
        h.connect().unwrap();
        let ev = next(&mut rx).await;
        assert_eq!(ev.button, h.id());
        match ev.notification {
            Notification::ConnectFailed(e) => assert!(e.is_retryable()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_verification_request_is_connect_failed() {
        struct Mute;
        impl Transport for Mute {
            fn open_link(&self, _: BdAddr) -> Result<(), TransportError> {
                Ok(())
            }
            fn close_link(&self, _: BdAddr) -> Result<(), TransportError> {
                Ok(())
            }
            fn send(&self, _: BdAddr, _: Vec<u8>) -> Result<(), TransportError> {
                Err(TransportError::SendFailed("queue full".into()))
            }
        }
        let (m, mut rx) = ButtonManager::new(Arc::new(Mute), ManagerConfig::default());
        let p = pairing(10);
        let addr = p.identity.address;
        let h = m.add_button(p).unwrap();
        h.connect().unwrap();
        m.handle_transport_event(TransportEvent::new(addr, LinkEvent::Up));
        assert_eq!(next(&mut rx).await.notification, Notification::Connected);
        assert_eq!(
            next(&mut rx).await.notification,
            Notification::ConnectFailed(ButtonError::Transport(TransportError::SendFailed(
                "queue full".into()
            )))
        );
        let status = h
            .wait_for(|s| s.state == ConnectionState::Disconnected)
            .await
            .unwrap();
        assert!(!status.ready);
    }

    #[tokio::test]
    async fn failed_close_still_finishes_disconnect() {
        struct Stuck;
        impl Transport for Stuck {
            fn open_link(&self, _: BdAddr) -> Result<(), TransportError> {
                Ok(())
            }
            fn close_link(&self, _: BdAddr) -> Result<(), TransportError> {
                Err(TransportError::Unavailable("adapter gone".into()))
            }
            fn send(&self, _: BdAddr, _: Vec<u8>) -> Result<(), TransportError> {
                Ok(())
            }
        }
        let (m, mut rx) = ButtonManager::new(Arc::new(Stuck), ManagerConfig::default());
        let p = pairing(11);
        let addr = p.identity.address;
        let h = m.add_button(p).unwrap();
        h.connect().unwrap();
        m.handle_transport_event(TransportEvent::new(addr, LinkEvent::Up));
        assert_eq!(next(&mut rx).await.notification, Notification::Connected);

        h.disconnect().unwrap();
        assert_eq!(
            next(&mut rx).await.notification,
            Notification::Disconnected(Some(DisconnectCause::LocalRequest))
        );
        h.wait_for(|s| s.state == ConnectionState::Disconnected)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn removed_button_reports_not_found() {
        let (m, _rx, _t) = manager();
        let h = m.add_button(pairing(5)).unwrap();
        let id = h.id();
        m.remove_button(id).unwrap();
        assert!(m.button(id).is_none());
        assert_eq!(h.connect(), Err(ButtonError::NotFound));
        assert_eq!(h.disconnect(), Err(ButtonError::NotFound));
        assert_eq!(
            h.set_trigger_mode(TriggerMode::Click),
            Err(ButtonError::NotFound)
        );
        assert_eq!(h.set_nickname(None), Err(ButtonError::NotFound));
        assert_eq!(h.status(), Err(ButtonError::NotFound));
        assert_eq!(m.remove_button(id), Err(ButtonError::NotFound));
        assert_eq!(m.mark_unpaired(id, None), Err(ButtonError::NotFound));
    }

    #[tokio::test]
    async fn nickname_and_trigger_mode_show_in_status() {
        let (m, _rx, _t) = manager();
        let h = m.add_button(pairing(6)).unwrap();
        h.set_nickname(Some("desk".into())).unwrap();
        h.set_trigger_mode(TriggerMode::ClickAndHold).unwrap();
        let status = h
            .wait_for(|s| s.identity.nickname.is_some())
            .await
            .unwrap();
        assert_eq!(status.identity.nickname.as_deref(), Some("desk"));
        let status = h
            .wait_for(|s| s.filter == TriggerMode::ClickAndHold.filter())
            .await
            .unwrap();
        assert_eq!(status.state, ConnectionState::Disconnected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_connect_disconnect_is_serialized() {
        let (m, mut rx, _t) = manager();
        let p = pairing(7);
        let addr = p.identity.address;
        let h = m.add_button(p).unwrap();

        let mut threads = Vec::new();
        for i in 0..8 {
            let h = h.clone();
            let m = m.clone();
            threads.push(std::thread::spawn(move || {
                for j in 0..50 {
                    match (i + j) % 4 {
                        0 => {
                            let _ = h.connect();
                        }
                        1 => {
                            let _ = h.disconnect();
                        }
                        2 => m.handle_transport_event(TransportEvent::new(addr, LinkEvent::Up)),
                        _ => m.handle_transport_event(TransportEvent::new(
                            addr,
                            LinkEvent::Down(DisconnectCause::RemoteClosed),
                        )),
                    }
                }
            }));
        }
        for t in threads {
            t.join().unwrap();
        }
        let _ = h.disconnect();
        m.handle_transport_event(TransportEvent::new(
            addr,
            LinkEvent::Down(DisconnectCause::RemoteClosed),
        ));
        h.wait_for(|s| s.state == ConnectionState::Disconnected)
            .await
            .unwrap();
        m.remove_button(h.id()).unwrap();
        drop(m);

        let mut link_open = false;
        while let Ok(Some(ev)) = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
            match ev.notification {
                Notification::Connected => {
                    assert!(!link_open, "two Connected without a disconnect");
                    link_open = true;
                }
                Notification::Disconnected(_) | Notification::ConnectFailed(_) => link_open = false,
                Notification::Ready | Notification::Button(_) => {
                    panic!("no button answered, nothing can be ready")
                }
                _ => {}
            }
        }
    }
}
