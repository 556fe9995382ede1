//! CAN transport abstraction (C1).
//!
//! This crate never talks to hardware directly. Callers supply a [`CanTransport`]
//! implementation -- a SocketCAN socket, a recorded-traffic player, an in-process
//! simulator (see [`crate::sim`]) -- and everything above it (ISO-TP, UDS, discovery)
//! is written against the trait alone.

/// A single CAN frame: an arbitration id and up to 8 data bytes.
///
/// Whether `can_id` is an 11-bit or 29-bit identifier is a property of the
/// [`crate::CanIdMode`] the caller configured, not of the frame itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    /// Arbitration id the frame was sent to / received on.
    pub can_id: u32,
    /// Frame payload, at most 8 bytes.
    pub data: Vec<u8>,
}

impl CanFrame {
    /// Builds a frame, panicking if `data` exceeds the 8-byte CAN payload limit.
    ///
    /// Use this only for ids/data you already know are well formed (tests, the
    /// simulator); transport implementations reading off the wire should construct
    /// the struct literal directly and let [`CanTransport::send`]'s caller validate.
    pub fn new(can_id: u32, data: Vec<u8>) -> Self {
        assert!(data.len() <= 8, "CAN payload must be at most 8 bytes");
        Self { can_id, data }
    }
}

/// Errors a [`CanTransport`] implementation may surface.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The caller asked to send more than 8 bytes in a single CAN frame.
    #[error("frame payload too large: {0} bytes (max 8)")]
    FrameTooLarge(usize),
    /// The underlying I/O (socket, serial port, file) failed.
    #[error("transport I/O error: {0}")]
    Io(String),
}

/// Result alias for [`CanTransport`] operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// The CAN transport contract this crate consumes.
///
/// Implementations own the physical (or simulated) bus. This crate never owns
/// bus lifecycle beyond calling `send`/`recv`/`close`.
pub trait CanTransport: Send {
    /// Sends a single CAN frame with the given arbitration id. `data` must be at
    /// most 8 bytes; implementations should return [`TransportError::FrameTooLarge`]
    /// rather than truncate.
    fn send(&mut self, can_id: u32, data: &[u8]) -> TransportResult<()>;

    /// Waits up to `timeout_ms` for the next inbound frame, returning `None` on
    /// timeout. A `timeout_ms` of `0` must return immediately with whatever is
    /// already buffered (or `None` if nothing is).
    fn recv(&mut self, timeout_ms: u32) -> TransportResult<Option<CanFrame>>;

    /// Releases any underlying resources. Safe to call more than once.
    fn close(&mut self) -> TransportResult<()>;
}
