//! Deterministic test support: a scripted transport, seeded RNG helpers
//! and re-exported manual time. Used by the crate's own test suite and
//! usable by integrators for driving the core without sockets.

pub use crate::clock::ManualTimeProvider;

use crate::transport::{Io, LinkState, Transport, TransportError};
use lumen_coap::{Message, decode, encode_vec};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::VecDeque;

pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// How the mock answers `rx_off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxOffBehavior {
    Done,
    Unsupported,
    Fail,
}

/// A scripted datagram transport.
///
/// Inbound datagrams are queued with [`MockTransport::push_rx`]; every
/// outbound datagram is captured in `tx`. One-shot `Again`/`InProgress`
/// outcomes and send failures can be injected to exercise the
/// non-blocking retry discipline.
pub struct MockTransport {
    pub rx: VecDeque<Vec<u8>>,
    pub tx: Vec<Vec<u8>>,
    /// Pending `InProgress` answers for connect, consumed first.
    pub connect_delays: u32,
    /// Pending `InProgress` answers for send.
    pub send_delays: u32,
    /// Fail the next send with an IO error.
    pub fail_next_send: bool,
    pub close_delays: u32,
    pub cleanup_delays: u32,
    pub rx_off: RxOffBehavior,
    pub rx_off_calls: u32,
    state: LinkState,
    mtu: usize,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> MockTransport {
        MockTransport {
            rx: VecDeque::new(),
            tx: Vec::new(),
            connect_delays: 0,
            send_delays: 0,
            fail_next_send: false,
            close_delays: 0,
            cleanup_delays: 0,
            rx_off: RxOffBehavior::Done,
            rx_off_calls: 0,
            state: LinkState::Closed,
            mtu: 1152,
        }
    }

    pub fn push_rx(&mut self, datagram: Vec<u8>) {
        self.rx.push_back(datagram);
    }

    pub fn push_rx_msg(&mut self, msg: &Message) {
        self.push_rx(encode_vec(msg).expect("test message encodes"));
    }

    /// Drains and decodes everything sent so far.
    pub fn take_tx(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.tx)
            .iter()
            .map(|bytes| decode(bytes).expect("sent datagram decodes"))
            .collect()
    }

    /// Raw captured datagrams, undecoded.
    pub fn take_tx_raw(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.tx)
    }
}

impl Transport for MockTransport {
    fn connect(&mut self, _host: &str, _port: u16) -> Result<Io<()>, TransportError> {
        if self.connect_delays > 0 {
            self.connect_delays -= 1;
            return Ok(Io::InProgress);
        }
        self.state = LinkState::Connected;
        Ok(Io::Done(()))
    }

    fn send(&mut self, data: &[u8]) -> Result<Io<usize>, TransportError> {
        if self.fail_next_send {
            self.fail_next_send = false;
            return Err(TransportError::Other("injected send failure".into()));
        }
        if self.send_delays > 0 {
            self.send_delays -= 1;
            return Ok(Io::InProgress);
        }
        self.tx.push(data.to_vec());
        Ok(Io::Done(data.len()))
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<Io<usize>, TransportError> {
        match self.rx.pop_front() {
            Some(datagram) => {
                let len = datagram.len().min(buf.len());
                buf[..len].copy_from_slice(&datagram[..len]);
                Ok(Io::Done(len))
            }
            None => Ok(Io::Again),
        }
    }

    fn close(&mut self) -> Result<Io<()>, TransportError> {
        if self.close_delays > 0 {
            self.close_delays -= 1;
            return Ok(Io::InProgress);
        }
        self.state = LinkState::Closed;
        Ok(Io::Done(()))
    }

    fn cleanup(&mut self) -> Result<Io<()>, TransportError> {
        if self.cleanup_delays > 0 {
            self.cleanup_delays -= 1;
            return Ok(Io::InProgress);
        }
        self.state = LinkState::Closed;
        Ok(Io::Done(()))
    }

    fn state(&self) -> LinkState {
        self.state
    }

    fn inner_mtu(&self) -> usize {
        self.mtu
    }

    fn rx_off(&mut self) -> Result<Io<()>, TransportError> {
        self.rx_off_calls += 1;
        match self.rx_off {
            RxOffBehavior::Done => Ok(Io::Done(())),
            RxOffBehavior::Unsupported => Err(TransportError::Unsupported),
            RxOffBehavior::Fail => Err(TransportError::Other("injected rx_off failure".into())),
        }
    }
}
