//! An in-process simulated CAN bus, used by this crate's own tests and suitable for
//! exercising a [`crate::service::DiagnosticService`] without real hardware.
//!
//! A [`CanTransport`] that a test can both drive (as the "tester" side) and answer
//! from (as a scripted "ECU" side), without any real bus.

use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use crate::can::{CanFrame, CanTransport, TransportError, TransportResult};

/// One end of an in-process CAN bus. Frames sent on one end arrive on the other.
pub struct ChannelEndpoint {
    tx: Sender<CanFrame>,
    rx: Receiver<CanFrame>,
}

impl std::fmt::Debug for ChannelEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelEndpoint").finish()
    }
}

impl CanTransport for ChannelEndpoint {
    fn send(&mut self, can_id: u32, data: &[u8]) -> TransportResult<()> {
        if data.len() > 8 {
            return Err(TransportError::FrameTooLarge(data.len()));
        }
        self.tx
            .send(CanFrame {
                can_id,
                data: data.to_vec(),
            })
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    fn recv(&mut self, timeout_ms: u32) -> TransportResult<Option<CanFrame>> {
        if timeout_ms == 0 {
            return Ok(self.rx.try_recv().ok());
        }
        match self.rx.recv_timeout(Duration::from_millis(timeout_ms as u64)) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Ok(None),
        }
    }

    fn close(&mut self) -> TransportResult<()> {
        Ok(())
    }
}

/// A connected pair of [`ChannelEndpoint`]s: whatever is sent on one arrives on the other.
pub struct ChannelPair;

impl ChannelPair {
    /// Builds a connected pair of endpoints.
    pub fn new() -> (ChannelEndpoint, ChannelEndpoint) {
        let (tx_a, rx_a) = std::sync::mpsc::channel();
        let (tx_b, rx_b) = std::sync::mpsc::channel();
        (
            ChannelEndpoint { tx: tx_a, rx: rx_b },
            ChannelEndpoint { tx: tx_b, rx: rx_a },
        )
    }
}

/// A scripted ISO-TP-aware fake ECU: given a function from a decoded UDS request
/// payload to an optional UDS response payload, runs a loop that ISO-TP-encodes
/// responses and answers any request addressed to `rx_id` (its own listening id).
///
/// Runs on a background thread for the lifetime of the test; the thread exits when
/// the channel endpoint disconnects (the test's tester side is dropped).
pub struct SimEcu {
    handle: Option<std::thread::JoinHandle<()>>,
}

impl std::fmt::Debug for SimEcu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimEcu").finish()
    }
}

impl SimEcu {
    /// Spawns a fake ECU listening on `rx_id` and replying on `tx_id`, using
    /// `respond` to compute a UDS response payload (or `None` to stay silent) for
    /// each fully-reassembled UDS request payload it sees.
    pub fn spawn<F>(mut endpoint: ChannelEndpoint, rx_id: u32, tx_id: u32, respond: F) -> Self
    where
        F: Fn(&[u8]) -> Option<Vec<u8>> + Send + 'static,
    {
        let handle = std::thread::spawn(move || {
            use crate::isotp::IsoTpTransport;
            loop {
                let mut isotp = IsoTpTransport::new(&mut endpoint, tx_id, rx_id, 2_000);
                let request = match isotp.recv_response() {
                    Ok(req) => req,
                    Err(_) => return,
                };
                if let Some(response) = respond(&request) {
                    if isotp.send(&response).is_err() {
                        return;
                    }
                }
            }
        });
        Self {
            handle: Some(handle),
        }
    }

    /// Blocks until the simulated ECU's background thread exits (the tester side
    /// disconnected or timed out).
    pub fn join(mut self) {
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_pair_delivers_frames_both_ways() {
        let (mut a, mut b) = ChannelPair::new();
        a.send(0x123, &[1, 2, 3]).unwrap();
        let frame = b.recv(100).unwrap().unwrap();
        assert_eq!(frame.can_id, 0x123);
        assert_eq!(frame.data, vec![1, 2, 3]);

        b.send(0x456, &[9]).unwrap();
        let frame = a.recv(100).unwrap().unwrap();
        assert_eq!(frame.can_id, 0x456);
    }

    #[test]
    fn recv_times_out_when_empty() {
        let (mut a, _b) = ChannelPair::new();
        assert!(a.recv(20).unwrap().is_none());
    }
}
