use std::io;
use thiserror::Error;

/// Outcome of a non-blocking transport call.
///
/// `Again` means "nothing to do right now" (an empty receive queue);
/// `InProgress` means the operation was started but has not completed and
/// the call must be repeated on a later [`crate::session::Session::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Io<T> {
    Done(T),
    Again,
    InProgress,
}

impl<T> Io<T> {
    pub fn is_done(&self) -> bool {
        matches!(self, Io::Done(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Closed,
    Connected,
}

/// Errors surfaced by a transport implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("transport is not connected")]
    NotConnected,
    #[error("operation not supported by this transport")]
    Unsupported,
    #[error("transport error: {0}")]
    Other(String),
}

/// The datagram transport capability (UDP or DTLS-over-UDP).
///
/// Every call is non-blocking: implementations return
/// [`Io::Again`]/[`Io::InProgress`] instead of blocking, and the core
/// retries on the next step. The concrete socket (and any DTLS layering)
/// lives entirely outside the core.
pub trait Transport {
    fn connect(&mut self, host: &str, port: u16) -> Result<Io<()>, TransportError>;

    /// Sends one datagram; `Done(n)` confirms `n` bytes handed to the OS.
    fn send(&mut self, data: &[u8]) -> Result<Io<usize>, TransportError>;

    /// Receives at most one datagram; `Again` when the queue is empty.
    fn recv(&mut self, buf: &mut [u8]) -> Result<Io<usize>, TransportError>;

    fn close(&mut self) -> Result<Io<()>, TransportError>;

    /// Releases all transport resources; repeated until `Done`.
    fn cleanup(&mut self) -> Result<Io<()>, TransportError>;

    fn state(&self) -> LinkState;

    /// Largest datagram payload the link carries without fragmentation.
    fn inner_mtu(&self) -> usize;

    /// Queue-mode hook: stop delivering inbound datagrams. Optional.
    fn rx_off(&mut self) -> Result<Io<()>, TransportError> {
        Err(TransportError::Unsupported)
    }
}
