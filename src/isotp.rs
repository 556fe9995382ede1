//! ISO-TP (ISO 15765-2) segmentation and reassembly over a [`CanTransport`] (C2).
//!
//! An [`IsoTpTransport`] binds a `tx`/`rx` CAN id pair and exposes a single
//! `request()` call that hides single/first/consecutive/flow-control framing from
//! the UDS layer above it.

use std::time::{Duration, Instant};

use crate::can::{CanFrame, CanTransport, TransportError};

/// Maximum ISO-TP payload length this crate supports (first-frame 12-bit length field).
pub const MAX_PAYLOAD_LEN: usize = 0x0FFF;

const PCI_SINGLE: u8 = 0x0;
const PCI_FIRST: u8 = 0x1;
const PCI_CONSECUTIVE: u8 = 0x2;
const PCI_FLOW_CONTROL: u8 = 0x3;

const FS_CONTINUE: u8 = 0x0;
const FS_WAIT: u8 = 0x1;
const FS_OVERFLOW: u8 = 0x2;

/// Errors raised while segmenting, sending, receiving, or reassembling an ISO-TP message.
#[derive(Debug, thiserror::Error)]
pub enum IsoTpError {
    /// The payload exceeds [`MAX_PAYLOAD_LEN`].
    #[error("payload too large for ISO-TP: {0} bytes (max {MAX_PAYLOAD_LEN})")]
    PayloadTooLarge(usize),
    /// A received frame was shorter than its declared PCI required.
    #[error("short ISO-TP frame")]
    ShortFrame,
    /// A received frame's PCI nibble was not one of single/first/consecutive/flow-control.
    #[error("unexpected ISO-TP PCI type: 0x{0:X}")]
    UnexpectedPci(u8),
    /// A consecutive frame arrived with the wrong sequence number.
    #[error("ISO-TP sequence mismatch: expected {expected}, got {got}")]
    SequenceMismatch {
        /// Sequence number (mod 16) the receiver expected.
        expected: u8,
        /// Sequence number the frame actually carried.
        got: u8,
    },
    /// The peer's flow-control frame reported overflow (FS=2).
    #[error("ISO-TP flow control overflow")]
    FlowControlOverflow,
    /// No frame (or no matching flow control) arrived within the operation's deadline.
    #[error("ISO-TP timeout waiting for {0}")]
    Timeout(&'static str),
    /// The underlying CAN transport failed.
    #[error("ISO-TP transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Result alias for ISO-TP operations.
pub type IsoTpResult<T> = Result<T, IsoTpError>;

/// Separation time this crate advertises in its own flow-control frames, and the
/// block size before requesting another flow-control frame from the peer while
/// receiving a multi-frame message.
#[derive(Debug, Copy, Clone)]
pub struct FlowControlParams {
    /// Number of consecutive frames the peer may send before waiting for another
    /// flow-control frame. `0` means unlimited.
    pub block_size: u8,
    /// Separation time byte as defined by ISO 15765-2: `0x00..=0x7F` milliseconds,
    /// `0xF1..=0xF9` hundreds-of-microseconds.
    pub st_min: u8,
}

impl Default for FlowControlParams {
    fn default() -> Self {
        Self {
            block_size: 0,
            st_min: 0,
        }
    }
}

/// Binds a CAN transport to a `tx`/`rx` id pair and performs ISO-TP framing over it.
///
/// One [`IsoTpTransport`] is created per request by the UDS client; there is no
/// persistent background channel, so each call owns its own timeout budget.
pub struct IsoTpTransport<'a> {
    transport: &'a mut dyn CanTransport,
    tx_id: u32,
    rx_id: u32,
    /// Remaining timeout budget for the *next* blocking operation, in milliseconds.
    /// Mutable so callers (the UDS client's pending-response wait) can shrink it
    /// between calls to [`IsoTpTransport::recv_response`].
    pub timeout_ms: u32,
    flow_control: FlowControlParams,
}

impl<'a> std::fmt::Debug for IsoTpTransport<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsoTpTransport")
            .field("tx_id", &self.tx_id)
            .field("rx_id", &self.rx_id)
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

impl<'a> IsoTpTransport<'a> {
    /// Binds `transport` to the given `tx`/`rx` ids with a per-operation timeout.
    pub fn new(transport: &'a mut dyn CanTransport, tx_id: u32, rx_id: u32, timeout_ms: u32) -> Self {
        Self {
            transport,
            tx_id,
            rx_id,
            timeout_ms,
            flow_control: FlowControlParams::default(),
        }
    }

    /// Overrides the flow-control parameters this side advertises when receiving a
    /// multi-frame message. Defaults to unlimited block size, zero separation time.
    pub fn with_flow_control(mut self, params: FlowControlParams) -> Self {
        self.flow_control = params;
        self
    }

    /// Sends `payload` and waits for a single ISO-TP response, observing `timeout_ms`
    /// as the overall deadline.
    pub fn request(&mut self, payload: &[u8]) -> IsoTpResult<Vec<u8>> {
        self.send(payload)?;
        self.recv_response()
    }

    /// Segments and sends `payload`, performing the full flow-control dance for
    /// multi-frame messages.
    pub fn send(&mut self, payload: &[u8]) -> IsoTpResult<()> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(IsoTpError::PayloadTooLarge(payload.len()));
        }
        if payload.len() <= 7 {
            self.send_single_frame(payload)
        } else {
            self.send_multi_frame(payload)
        }
    }

    fn send_single_frame(&mut self, payload: &[u8]) -> IsoTpResult<()> {
        let mut data = vec![0u8; 8];
        data[0] = (PCI_SINGLE << 4) | (payload.len() as u8 & 0x0F);
        data[1..1 + payload.len()].copy_from_slice(payload);
        self.transport.send(self.tx_id, &data)?;
        Ok(())
    }

    fn send_multi_frame(&mut self, payload: &[u8]) -> IsoTpResult<()> {
        let len = payload.len();
        let mut data = [0u8; 8];
        data[0] = (PCI_FIRST << 4) | (((len >> 8) & 0x0F) as u8);
        data[1] = (len & 0xFF) as u8;
        data[2..8].copy_from_slice(&payload[0..6]);
        self.transport.send(self.tx_id, &data)?;

        let mut sent = 6usize;
        let mut seq: u8 = 1;
        let mut frames_since_fc = 0u8;

        let mut fc = self.await_flow_control()?;

        while sent < len {
            if fc.block_size != 0 && frames_since_fc >= fc.block_size {
                fc = self.await_flow_control()?;
                frames_since_fc = 0;
            }

            let chunk_len = (len - sent).min(7);
            let mut frame = [0u8; 8];
            frame[0] = (PCI_CONSECUTIVE << 4) | (seq & 0x0F);
            frame[1..1 + chunk_len].copy_from_slice(&payload[sent..sent + chunk_len]);
            self.transport.send(self.tx_id, &frame)?;

            sent += chunk_len;
            seq = (seq + 1) & 0x0F;
            frames_since_fc += 1;

            if sent < len {
                sleep_separation_time(fc.st_min);
            }
        }
        Ok(())
    }

    /// Waits for a flow-control frame addressed to `rx_id`. On `FS=wait`, keeps
    /// waiting for another flow-control frame (within the overall deadline) rather
    /// than failing. On `FS=overflow`, fails immediately.
    fn await_flow_control(&mut self) -> IsoTpResult<FlowControlParams> {
        let deadline = Instant::now() + Duration::from_millis(self.timeout_ms as u64);
        loop {
            let remaining = remaining_ms(deadline);
            if remaining == 0 {
                return Err(IsoTpError::Timeout("flow control"));
            }
            let frame = match self.transport.recv(remaining)? {
                Some(f) => f,
                None => continue,
            };
            if frame.can_id != self.rx_id || frame.data.is_empty() {
                continue;
            }
            let pci_type = frame.data[0] >> 4;
            if pci_type != PCI_FLOW_CONTROL {
                continue;
            }
            let fs = frame.data[0] & 0x0F;
            let block_size = frame.data.get(1).copied().unwrap_or(0);
            let st_min = frame.data.get(2).copied().unwrap_or(0);
            match fs {
                FS_CONTINUE => return Ok(FlowControlParams { block_size, st_min }),
                FS_WAIT => continue,
                FS_OVERFLOW => return Err(IsoTpError::FlowControlOverflow),
                _ => continue,
            }
        }
    }

    /// Receives a single ISO-TP response (single or multi-frame), sending our own
    /// flow-control frame(s) as needed while reassembling.
    pub fn recv_response(&mut self) -> IsoTpResult<Vec<u8>> {
        let deadline = Instant::now() + Duration::from_millis(self.timeout_ms as u64);
        loop {
            let remaining = remaining_ms(deadline);
            if remaining == 0 {
                return Err(IsoTpError::Timeout("response"));
            }
            let frame = match self.transport.recv(remaining)? {
                Some(f) => f,
                None => continue,
            };
            if frame.can_id != self.rx_id || frame.data.is_empty() {
                continue;
            }
            let pci_type = frame.data[0] >> 4;
            return match pci_type {
                PCI_SINGLE => self.decode_single_frame(&frame),
                PCI_FIRST => self.receive_multi_frame(&frame, deadline),
                _ => Err(IsoTpError::UnexpectedPci(pci_type)),
            };
        }
    }

    fn decode_single_frame(&self, frame: &CanFrame) -> IsoTpResult<Vec<u8>> {
        let len = (frame.data[0] & 0x0F) as usize;
        if len == 0 || frame.data.len() < 1 + len {
            return Err(IsoTpError::ShortFrame);
        }
        Ok(frame.data[1..1 + len].to_vec())
    }

    fn receive_multi_frame(&mut self, first: &CanFrame, deadline: Instant) -> IsoTpResult<Vec<u8>> {
        if first.data.len() < 2 {
            return Err(IsoTpError::ShortFrame);
        }
        let len = (((first.data[0] & 0x0F) as usize) << 8) | first.data[1] as usize;
        if len > MAX_PAYLOAD_LEN {
            return Err(IsoTpError::PayloadTooLarge(len));
        }
        let mut out = Vec::with_capacity(len);
        let first_chunk = &first.data[2..];
        out.extend_from_slice(&first_chunk[..first_chunk.len().min(len)]);

        self.send_flow_control(FS_CONTINUE)?;

        let mut expected_seq: u8 = 1;
        while out.len() < len {
            let remaining = remaining_ms(deadline);
            if remaining == 0 {
                return Err(IsoTpError::Timeout("consecutive frame"));
            }
            let frame = match self.transport.recv(remaining)? {
                Some(f) => f,
                None => continue,
            };
            if frame.can_id != self.rx_id || frame.data.is_empty() {
                continue;
            }
            let pci_type = frame.data[0] >> 4;
            if pci_type != PCI_CONSECUTIVE {
                return Err(IsoTpError::UnexpectedPci(pci_type));
            }
            let seq = frame.data[0] & 0x0F;
            if seq != expected_seq {
                return Err(IsoTpError::SequenceMismatch {
                    expected: expected_seq,
                    got: seq,
                });
            }
            let remaining_len = len - out.len();
            let chunk = &frame.data[1..];
            let take = chunk.len().min(remaining_len);
            out.extend_from_slice(&chunk[..take]);
            expected_seq = (expected_seq + 1) & 0x0F;
        }
        Ok(out)
    }

    fn send_flow_control(&mut self, fs: u8) -> IsoTpResult<()> {
        let frame = [
            (PCI_FLOW_CONTROL << 4) | (fs & 0x0F),
            self.flow_control.block_size,
            self.flow_control.st_min,
            0,
            0,
            0,
            0,
            0,
        ];
        self.transport.send(self.tx_id, &frame)?;
        Ok(())
    }
}

fn remaining_ms(deadline: Instant) -> u32 {
    let now = Instant::now();
    if now >= deadline {
        0
    } else {
        (deadline - now).as_millis().min(u32::MAX as u128) as u32
    }
}

fn sleep_separation_time(st_min: u8) {
    let dur = match st_min {
        0x00..=0x7F => Duration::from_millis(st_min as u64),
        0xF1..=0xF9 => Duration::from_micros((st_min - 0xF0) as u64 * 100),
        _ => Duration::from_millis(0),
    };
    if !dur.is_zero() {
        std::thread::sleep(dur);
    }
}
