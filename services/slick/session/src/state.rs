//! Connection state machine.
//!
//! The open link lives inside the phase that owns it, so a link can only be
//! written to in the phases where that is legal. Every connection attempt
//! gets a new generation; transitions requested by tasks belonging to an
//! older generation are ignored.

use crate::transport::LinkFrame;
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Observable connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No link and no retry pending
    Disconnected,
    /// Opening the physical connection
    Connecting,
    /// Link open, handshake in flight
    AwaitingHandshake,
    /// Session established
    Connected,
    /// No link, retry supervisor armed
    Reconnecting,
    /// Shut down for good
    Closed,
}

/// An open link plus the tasks serving it. Dropping it closes the link.
#[derive(Debug)]
pub(crate) struct ActiveLink {
    outbound: mpsc::UnboundedSender<LinkFrame>,
    reader: JoinHandle<()>,
    ping: Option<JoinHandle<()>>,
}

impl ActiveLink {
    pub(crate) fn new(outbound: mpsc::UnboundedSender<LinkFrame>, reader: JoinHandle<()>) -> Self {
        Self {
            outbound,
            reader,
            ping: None,
        }
    }

    /// Write one text frame; false if the link is gone
    pub(crate) fn send_text(&self, text: String) -> bool {
        self.outbound.send(LinkFrame::Text(text)).is_ok()
    }

    /// Ask the link to close after pending frames, then release it
    pub(crate) fn close(self) {
        let _ = self.outbound.send(LinkFrame::Close);
    }
}

impl Drop for ActiveLink {
    fn drop(&mut self) {
        self.reader.abort();
        if let Some(ping) = self.ping.take() {
            ping.abort();
        }
    }
}

#[derive(Debug)]
enum Phase {
    Idle,
    Connecting {
        generation: u64,
    },
    AwaitingHandshake {
        generation: u64,
        link: ActiveLink,
        handshake_request: Option<u64>,
    },
    Connected {
        generation: u64,
        link: ActiveLink,
    },
    Closed,
}

/// What was left behind when a link was abandoned
#[derive(Debug, Default)]
pub(crate) struct Abandoned {
    pub(crate) link: Option<ActiveLink>,
    pub(crate) handshake_request: Option<u64>,
}

/// Connection phase plus the outbound queue used while not connected
#[derive(Debug)]
pub(crate) struct Machine {
    phase: Phase,
    generation: u64,
    queue: VecDeque<String>,
}

impl Machine {
    pub(crate) fn new() -> Self {
        Self {
            phase: Phase::Idle,
            generation: 0,
            queue: VecDeque::new(),
        }
    }

    pub(crate) fn state(&self, supervising: bool) -> ConnectionState {
        match self.phase {
            Phase::Idle if supervising => ConnectionState::Reconnecting,
            Phase::Idle => ConnectionState::Disconnected,
            Phase::Connecting { .. } => ConnectionState::Connecting,
            Phase::AwaitingHandshake { .. } => ConnectionState::AwaitingHandshake,
            Phase::Connected { .. } => ConnectionState::Connected,
            Phase::Closed => ConnectionState::Closed,
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        matches!(self.phase, Phase::Connected { .. })
    }

    pub(crate) fn is_closed(&self) -> bool {
        matches!(self.phase, Phase::Closed)
    }

    /// Whether `generation` still owns the machine
    pub(crate) fn is_current(&self, generation: u64) -> bool {
        match self.phase {
            Phase::Connecting { generation: g }
            | Phase::AwaitingHandshake { generation: g, .. }
            | Phase::Connected { generation: g, .. } => g == generation,
            Phase::Idle | Phase::Closed => false,
        }
    }

    /// Start a new attempt. Returns its generation and what it replaces.
    pub(crate) fn begin_connect(&mut self) -> Option<(u64, Abandoned)> {
        if self.is_closed() {
            return None;
        }
        let previous = self.take_link();
        self.generation += 1;
        self.phase = Phase::Connecting {
            generation: self.generation,
        };
        Some((self.generation, previous))
    }

    /// The link for `generation` is open. Hands the link back if the attempt
    /// was superseded meanwhile.
    pub(crate) fn link_opened(&mut self, generation: u64, link: ActiveLink) -> Result<(), ActiveLink> {
        match self.phase {
            Phase::Connecting { generation: g } if g == generation => {
                self.phase = Phase::AwaitingHandshake {
                    generation,
                    link,
                    handshake_request: None,
                };
                Ok(())
            }
            _ => Err(link),
        }
    }

    /// Send a handshake frame on the link of `generation`, bypassing the queue
    pub(crate) fn send_handshake(&mut self, generation: u64, request_id: u64, text: String) -> bool {
        match &mut self.phase {
            Phase::AwaitingHandshake {
                generation: g,
                link,
                handshake_request,
            } if *g == generation => {
                *handshake_request = Some(request_id);
                link.send_text(text)
            }
            _ => false,
        }
    }

    /// Handshake succeeded: become connected and flush the queue in order.
    /// Returns the number of flushed frames, or `None` if superseded.
    pub(crate) fn handshake_complete(&mut self, generation: u64) -> Option<usize> {
        let phase = std::mem::replace(&mut self.phase, Phase::Idle);
        match phase {
            Phase::AwaitingHandshake {
                generation: g,
                link,
                ..
            } if g == generation => {
                let mut flushed = 0;
                while let Some(text) = self.queue.pop_front() {
                    if !link.send_text(text.clone()) {
                        // Keep the rest for the next connection
                        self.queue.push_front(text);
                        warn!("Link closed while flushing, {} frame(s) kept", self.queue.len());
                        break;
                    }
                    flushed += 1;
                }
                self.phase = Phase::Connected { generation, link };
                Some(flushed)
            }
            other => {
                self.phase = other;
                None
            }
        }
    }

    /// Attach the ping task to the connected link of `generation`
    pub(crate) fn set_ping_task(&mut self, generation: u64, task: JoinHandle<()>) {
        match &mut self.phase {
            Phase::Connected { generation: g, link } if *g == generation => {
                if let Some(old) = link.ping.replace(task) {
                    old.abort();
                }
            }
            _ => task.abort(),
        }
    }

    /// Transmit when connected, queue otherwise
    pub(crate) fn send_or_queue(&mut self, text: String) -> bool {
        if let Phase::Connected { link, .. } = &self.phase {
            if link.send_text(text.clone()) {
                return true;
            }
            debug!("Link refused frame, queueing");
        }
        self.queue.push_back(text);
        false
    }

    /// Transmit on the open link of `generation` only (ping/pong)
    pub(crate) fn send_direct(&self, generation: u64, text: String) -> bool {
        match &self.phase {
            Phase::AwaitingHandshake { generation: g, link, .. }
            | Phase::Connected { generation: g, link } if *g == generation => link.send_text(text),
            _ => false,
        }
    }

    /// The link of `generation` failed or closed: go idle
    pub(crate) fn abandon(&mut self, generation: u64) -> Option<Abandoned> {
        if !self.is_current(generation) {
            return None;
        }
        Some(self.take_link())
    }

    /// Go idle, returning whatever link was open and the handshake it was
    /// waiting for
    pub(crate) fn take_link(&mut self) -> Abandoned {
        if self.is_closed() {
            return Abandoned::default();
        }
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::AwaitingHandshake {
                link,
                handshake_request,
                ..
            } => Abandoned {
                link: Some(link),
                handshake_request,
            },
            Phase::Connected { link, .. } => Abandoned {
                link: Some(link),
                handshake_request: None,
            },
            _ => Abandoned::default(),
        }
    }

    /// Enter the terminal state, returning whatever was open
    pub(crate) fn close(&mut self) -> Abandoned {
        let abandoned = self.take_link();
        self.phase = Phase::Closed;
        abandoned
    }

    pub(crate) fn queued(&self) -> usize {
        self.queue.len()
    }
}
