//! Event decoder: turns sealed link frames into button events.
//!
//! A decoder lives for exactly one verified connection. Right after
//! verification the button replays the events it queued while disconnected
//! (the connection burst), in whatever order its buffer holds them, and ends
//! the burst with `QueueDrained`. Queued events are held back until the burst
//! ends and then released oldest first; a real-time event also ends the burst,
//! so it is always delivered after every replayed event.

use std::collections::VecDeque;

use crate::protocol::{EventFilter, EventKind, Message, RevokeReason};
use crate::wire::{FrameDecodeError, Opener};

/// A decoded button action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ButtonEvent {
    pub kind: EventKind,
    /// Happened while the button was disconnected and was replayed on connect.
    pub queued: bool,
    /// Whole seconds since the event happened, rounded to nearest. 0 for real-time events.
    pub age_secs: u32,
    /// Button-assigned sequence number.
    pub seq: u32,
    /// Presses since the button last booted.
    pub press_count: u32,
}

/// Output of one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Button(ButtonEvent),
    Battery(u16),
    Revoked(RevokeReason),
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("bad frame: {0}")]
    Frame(#[from] FrameDecodeError),
    #[error("unexpected {0} message from button")]
    Unexpected(&'static str),
    #[error("more than {0} queued events in one burst")]
    BacklogFull(usize),
}

/// Counters over the decoder's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStats {
    pub delivered: u64,
    pub filtered: u64,
}

/// Nearest whole second between occurrence and transmission, both on the button's clock.
pub fn age_secs(timestamp_ms: u64, device_time_ms: u64) -> u32 {
    let rounded = device_time_ms.saturating_sub(timestamp_ms).saturating_add(500) / 1000;
    u32::try_from(rounded).unwrap_or(u32::MAX)
}

struct Held {
    timestamp_ms: u64,
    event: ButtonEvent,
}

pub struct EventDecoder {
    opener: Opener,
    filter: EventFilter,
    backlog: Vec<Held>,
    draining: bool,
    max_backlog: usize,
    highest_seq: Option<u32>,
    stats: DecoderStats,
}

impl EventDecoder {
    pub fn new(opener: Opener, filter: EventFilter, max_backlog: usize) -> Self {
        Self {
            opener,
            filter,
            backlog: Vec::new(),
            draining: true,
            max_backlog,
            highest_seq: None,
            stats: DecoderStats::default(),
        }
    }

    pub fn filter(&self) -> EventFilter {
        self.filter
    }

    /// Held events the new filter excludes are dropped too.
    pub fn set_filter(&mut self, filter: EventFilter) {
        self.filter = filter;
        let before = self.backlog.len();
        self.backlog.retain(|h| filter.allows(h.event.kind));
        self.stats.filtered += (before - self.backlog.len()) as u64;
    }

    /// True until the connection burst has ended.
    pub fn is_draining(&self) -> bool {
        self.draining
    }

    /// Highest sequence number consumed so far, delivered or filtered.
    pub fn highest_seq(&self) -> Option<u32> {
        self.highest_seq
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    /// Decode every frame contained in `bytes`.
    pub fn decode(&mut self, bytes: &[u8]) -> Result<Vec<Decoded>, DecodeError> {
        let mut out = Vec::new();
        let mut offset = 0;
        while offset < bytes.len() {
            let (msg, consumed) = self.opener.open(&bytes[offset..])?;
            offset += consumed;
            self.accept(msg, &mut out)?;
        }
        Ok(out)
    }

    /// End the burst and release held events, oldest first.
    pub fn flush(&mut self) -> Vec<Decoded> {
        self.draining = false;
        let mut held = std::mem::take(&mut self.backlog);
        held.sort_by_key(|h| (h.timestamp_ms, h.event.seq));
        self.stats.delivered += held.len() as u64;
        held.into_iter().map(|h| Decoded::Button(h.event)).collect()
    }

    /// Lazily decode a finite sequence of frames, flushing when it runs out.
    pub fn events<I>(&mut self, frames: I) -> Events<'_, I::IntoIter>
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        Events {
            decoder: self,
            frames: frames.into_iter(),
            ready: VecDeque::new(),
            done: false,
        }
    }

    fn accept(&mut self, msg: Message, out: &mut Vec<Decoded>) -> Result<(), DecodeError> {
        match msg {
            Message::ButtonEvent {
                seq,
                kind,
                queued,
                timestamp_ms,
                device_time_ms,
                press_count,
            } => {
                self.highest_seq = Some(self.highest_seq.map_or(seq, |h| h.max(seq)));
                if !self.filter.allows(kind) {
                    self.stats.filtered += 1;
                    return Ok(());
                }
                let event = ButtonEvent {
                    kind,
                    queued,
                    age_secs: if queued {
                        age_secs(timestamp_ms, device_time_ms)
                    } else {
                        0
                    },
                    seq,
                    press_count,
                };
                if queued && self.draining {
                    if self.backlog.len() >= self.max_backlog {
                        return Err(DecodeError::BacklogFull(self.max_backlog));
                    }
                    self.backlog.push(Held {
                        timestamp_ms,
                        event,
                    });
                    return Ok(());
                }
                if self.draining {
                    out.extend(self.flush());
                }
                self.stats.delivered += 1;
                out.push(Decoded::Button(event));
            }
            Message::QueueDrained => out.extend(self.flush()),
            Message::BatteryStatus { level } => out.push(Decoded::Battery(level)),
            Message::PairingRevoked { reason } => out.push(Decoded::Revoked(reason)),
            Message::VerifyRequest { .. } | Message::VerifyResponse { .. } => {
                return Err(DecodeError::Unexpected("verification"))
            }
            Message::VerifyRejected { .. } => return Err(DecodeError::Unexpected("rejection")),
            Message::SetTriggerMode { .. } | Message::AckEvents { .. } => {
                return Err(DecodeError::Unexpected("host-bound"))
            }
        }
        Ok(())
    }
}

/// Iterator returned by [`EventDecoder::events`].
pub struct Events<'d, I> {
    decoder: &'d mut EventDecoder,
    frames: I,
    ready: VecDeque<Decoded>,
    done: bool,
}

impl<I> Iterator for Events<'_, I>
where
    I: Iterator,
    I::Item: AsRef<[u8]>,
{
    type Item = Result<Decoded, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(decoded) = self.ready.pop_front() {
                return Some(Ok(decoded));
            }
            if self.done {
                return None;
            }
            match self.frames.next() {
                Some(frame) => match self.decoder.decode(frame.as_ref()) {
                    Ok(decoded) => self.ready.extend(decoded),
                    Err(e) => return Some(Err(e)),
                },
                None => {
                    self.done = true;
                    self.ready.extend(self.decoder.flush());
                }
            }
        }
    }
}
