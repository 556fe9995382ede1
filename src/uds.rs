//! UDS (ISO 14229-1) request/response engine (C3): P2/P2* timing, pending-response
//! handling, NRC classification, and the service calls this crate needs.

use crate::isotp::{IsoTpError, IsoTpTransport};
use crate::topology::ids_for_ecu;
use crate::{can::CanTransport, CanIdMode, ValidationError};

/// Default `P2` timeout (first-response deadline), in milliseconds.
pub const DEFAULT_P2_MS: u32 = 50;
/// Default `P2*` timeout (deadline for a final response after a `0x78` pending
/// negative response), in milliseconds.
pub const DEFAULT_P2_STAR_MS: u32 = 5000;

const SID_DIAGNOSTIC_SESSION_CONTROL: u8 = 0x10;
const SID_READ_DTC_INFORMATION: u8 = 0x19;
const SID_CLEAR_DIAGNOSTIC_INFORMATION: u8 = 0x14;
const SID_READ_DATA_BY_IDENTIFIER: u8 = 0x22;
const SID_WRITE_DATA_BY_IDENTIFIER: u8 = 0x2E;
const SID_SECURITY_ACCESS: u8 = 0x27;

const NEGATIVE_RESPONSE_SID: u8 = 0x7F;
const NRC_RESPONSE_PENDING: u8 = 0x78;

const SUB_READ_DTC_BY_STATUS_MASK: u8 = 0x02;
const SUB_READ_DTC_SNAPSHOT_IDENTIFICATION: u8 = 0x04;
const SUB_READ_DTC_SNAPSHOT_RECORD: u8 = 0x05;

/// Negative response code names this crate recognizes, keyed by byte value.
/// Mirrors ISO 14229-1 Table A.1; not exhaustive beyond the codes that table names.
const NRC_NAMES: &[(u8, &str)] = &[
    (0x10, "generalReject"),
    (0x11, "serviceNotSupported"),
    (0x12, "subFunctionNotSupported"),
    (0x13, "incorrectMessageLengthOrInvalidFormat"),
    (0x14, "responseTooLong"),
    (0x21, "busyRepeatRequest"),
    (0x22, "conditionsNotCorrect"),
    (0x24, "requestSequenceError"),
    (0x31, "requestOutOfRange"),
    (0x33, "securityAccessDenied"),
    (0x35, "invalidKey"),
    (0x36, "exceedNumberOfAttempts"),
    (0x37, "requiredTimeDelayNotExpired"),
    (0x78, "requestCorrectlyReceivedResponsePending"),
    (0x7E, "subFunctionNotSupportedInActiveSession"),
    (0x7F, "serviceNotSupportedInActiveSession"),
];

/// Security-access-related NRCs, classified as a distinct family.
pub const SECURITY_NRCS: &[u8] = &[0x33, 0x35, 0x36, 0x37];

/// Returns the canonical lowerCamelCase name for a negative response code, or
/// `"isoSaeReserved"` if this crate has no specific name for it.
pub fn nrc_name(nrc: u8) -> &'static str {
    NRC_NAMES
        .iter()
        .find(|(code, _)| *code == nrc)
        .map(|(_, name)| *name)
        .unwrap_or("isoSaeReserved")
}

/// `true` if `nrc` belongs to the security-access family.
pub fn is_security_nrc(nrc: u8) -> bool {
    SECURITY_NRCS.contains(&nrc)
}

/// Errors raised by [`UdsClient`] service calls.
#[derive(Debug, thiserror::Error)]
pub enum UdsError {
    /// The underlying ISO-TP transport failed.
    #[error(transparent)]
    IsoTp(#[from] IsoTpError),
    /// The ECU address or CAN-id-mode combination is invalid.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// The ECU returned `0x7F <sid> <nrc>`.
    #[error("negative response to sid 0x{sid:02X}: {nrc_name} (nrc 0x{nrc:02X})")]
    NegativeResponse {
        /// The service id the request was sent with.
        sid: u8,
        /// The raw negative response code.
        nrc: u8,
        /// [`nrc_name`] of `nrc`.
        nrc_name: &'static str,
    },
    /// The response did not begin with the expected positive-response sid, or was
    /// otherwise too short to parse.
    #[error("unexpected response from ECU: {0}")]
    UnexpectedResponse(String),
}

impl UdsError {
    /// `true` if this error is a negative response in the security-access family:
    /// the caller needs to authenticate rather than retry blindly.
    pub fn is_security(&self) -> bool {
        matches!(self, UdsError::NegativeResponse { nrc, .. } if is_security_nrc(*nrc))
    }
}

/// Result alias for [`UdsClient`] operations.
pub type UdsResult<T> = Result<T, UdsError>;

/// A UDS request/response client bound to one "active ECU" at a time: every
/// service call operates against whichever ECU [`UdsClient::set_ecu`] last selected.
pub struct UdsClient<'a> {
    transport: &'a mut dyn CanTransport,
    can_id_mode: CanIdMode,
    tx_id: u32,
    rx_id: u32,
    /// `P2`: deadline for the first response to a request, in milliseconds.
    pub p2_ms: u32,
    /// `P2*`: deadline for a final response after a `0x78` pending response.
    pub p2_star_ms: u32,
}

impl<'a> std::fmt::Debug for UdsClient<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdsClient")
            .field("can_id_mode", &self.can_id_mode)
            .field("tx_id", &self.tx_id)
            .field("rx_id", &self.rx_id)
            .field("p2_ms", &self.p2_ms)
            .field("p2_star_ms", &self.p2_star_ms)
            .finish()
    }
}

impl<'a> UdsClient<'a> {
    /// Builds a client against `ecu` under `can_id_mode`, using the default P2/P2*
    /// timing.
    pub fn new(
        transport: &'a mut dyn CanTransport,
        ecu: &str,
        can_id_mode: CanIdMode,
    ) -> Result<Self, ValidationError> {
        let (tx_id, rx_id) = ids_for_ecu(ecu, can_id_mode)?;
        Ok(Self {
            transport,
            can_id_mode,
            tx_id,
            rx_id,
            p2_ms: DEFAULT_P2_MS,
            p2_star_ms: DEFAULT_P2_STAR_MS,
        })
    }

    /// Re-binds this client to a different ECU, keeping the same transport and
    /// timing configuration.
    pub fn set_ecu(&mut self, ecu: &str) -> Result<(), ValidationError> {
        let (tx_id, rx_id) = ids_for_ecu(ecu, self.can_id_mode)?;
        self.tx_id = tx_id;
        self.rx_id = rx_id;
        Ok(())
    }

    /// Sends `sid`+`payload`, observing `P2` for the first response and `P2*` for
    /// any response past a `0x78` pending negative response. Returns the
    /// full positive response bytes (including the echoed `sid+0x40`).
    fn request(&mut self, sid: u8, payload: &[u8]) -> UdsResult<Vec<u8>> {
        let mut full = Vec::with_capacity(1 + payload.len());
        full.push(sid);
        full.extend_from_slice(payload);

        let mut isotp = IsoTpTransport::new(self.transport, self.tx_id, self.rx_id, self.p2_ms);
        log::debug!("uds tx sid=0x{:02X} payload={:02X?}", sid, payload);
        isotp.send(&full)?;

        let positive_sid = sid.wrapping_add(0x40);
        loop {
            let resp = isotp.recv_response()?;
            if resp.len() >= 3 && resp[0] == NEGATIVE_RESPONSE_SID {
                let nrc = resp[2];
                if nrc == NRC_RESPONSE_PENDING {
                    log::debug!("uds pending response (0x78), waiting up to P2* for sid 0x{:02X}", sid);
                    isotp.timeout_ms = self.p2_star_ms;
                    continue;
                }
                log::warn!("uds negative response sid=0x{:02X} nrc=0x{:02X} ({})", sid, nrc, nrc_name(nrc));
                return Err(UdsError::NegativeResponse {
                    sid,
                    nrc,
                    nrc_name: nrc_name(nrc),
                });
            }
            if resp.first() != Some(&positive_sid) {
                return Err(UdsError::UnexpectedResponse(format!(
                    "expected sid 0x{:02X}, got {:02X?}",
                    positive_sid, resp
                )));
            }
            log::debug!("uds rx {:02X?}", resp);
            return Ok(resp);
        }
    }

    /// `DiagnosticSessionControl` (`0x10`). Returns `Ok(())` only if the response
    /// is positive and echoes `session`.
    pub fn diagnostic_session_control(&mut self, session: u8) -> UdsResult<()> {
        let resp = self.request(SID_DIAGNOSTIC_SESSION_CONTROL, &[session])?;
        if resp.get(1) != Some(&session) {
            return Err(UdsError::UnexpectedResponse(format!(
                "session echo mismatch: expected {session:02X}, got {resp:02X?}"
            )));
        }
        Ok(())
    }

    /// `ReadDTCInformation` sub `0x02` with the given status mask. Returns the raw
    /// `(dtc_hi, dtc_lo, status)` triples.
    pub fn read_dtc_by_status_mask(&mut self, status_mask: u8) -> UdsResult<Vec<(u8, u8, u8)>> {
        let resp = self.request(SID_READ_DTC_INFORMATION, &[SUB_READ_DTC_BY_STATUS_MASK, status_mask])?;
        if resp.len() < 3 {
            return Err(UdsError::UnexpectedResponse("short DTC response".to_string()));
        }
        let body = &resp[3..];
        if body.len() % 4 != 0 {
            return Err(UdsError::UnexpectedResponse("DTC body not a multiple of 4".to_string()));
        }
        Ok(body
            .chunks_exact(4)
            .map(|c| (c[0], c[1], c[2]))
            .collect())
    }

    /// `ClearDiagnosticInformation` (`0x14`) for all groups (`FF FF FF`).
    pub fn clear_diagnostic_information(&mut self) -> UdsResult<()> {
        self.request(SID_CLEAR_DIAGNOSTIC_INFORMATION, &[0xFF, 0xFF, 0xFF])?;
        Ok(())
    }

    /// `ReadDataByIdentifier` (`0x22`). Returns the payload bytes past the echoed
    /// `62 hi lo` header.
    pub fn read_data_by_identifier(&mut self, did: u16) -> UdsResult<Vec<u8>> {
        let hi = (did >> 8) as u8;
        let lo = (did & 0xFF) as u8;
        let resp = self.request(SID_READ_DATA_BY_IDENTIFIER, &[hi, lo])?;
        if resp.len() < 3 || resp[1] != hi || resp[2] != lo {
            return Err(UdsError::UnexpectedResponse(format!(
                "DID echo mismatch for {did:04X}: {resp:02X?}"
            )));
        }
        Ok(resp[3..].to_vec())
    }

    /// `WriteDataByIdentifier` (`0x2E`).
    pub fn write_data_by_identifier(&mut self, did: u16, data: &[u8]) -> UdsResult<()> {
        let hi = (did >> 8) as u8;
        let lo = (did & 0xFF) as u8;
        let mut payload = Vec::with_capacity(2 + data.len());
        payload.push(hi);
        payload.push(lo);
        payload.extend_from_slice(data);
        let resp = self.request(SID_WRITE_DATA_BY_IDENTIFIER, &payload)?;
        if resp.len() < 3 || resp[1] != hi || resp[2] != lo {
            return Err(UdsError::UnexpectedResponse(format!(
                "DID echo mismatch for write {did:04X}: {resp:02X?}"
            )));
        }
        Ok(())
    }

    /// `SecurityAccess` (`0x27`) seed request for an odd sub-function `level`.
    /// Returns the ECU-supplied seed bytes.
    pub fn security_access_request_seed(&mut self, level: u8) -> UdsResult<Vec<u8>> {
        let resp = self.request(SID_SECURITY_ACCESS, &[level])?;
        if resp.len() < 2 || resp[1] != level {
            return Err(UdsError::UnexpectedResponse(format!(
                "security access level echo mismatch: {resp:02X?}"
            )));
        }
        Ok(resp[2..].to_vec())
    }

    /// `SecurityAccess` (`0x27`) key send for `level+1`.
    pub fn security_access_send_key(&mut self, level: u8, key: &[u8]) -> UdsResult<()> {
        let mut payload = Vec::with_capacity(1 + key.len());
        payload.push(level + 1);
        payload.extend_from_slice(key);
        let resp = self.request(SID_SECURITY_ACCESS, &payload)?;
        if resp.len() < 2 || resp[1] != level + 1 {
            return Err(UdsError::UnexpectedResponse(format!(
                "security access key echo mismatch: {resp:02X?}"
            )));
        }
        Ok(())
    }

    /// `ReadDTCInformation` sub `0x04`: snapshot identification. Returns raw
    /// `(dtc_hi, dtc_lo, record_id)` triples.
    pub fn read_dtc_snapshot_identification(&mut self, status_mask: u8) -> UdsResult<Vec<(u8, u8, u8)>> {
        let resp = self.request(
            SID_READ_DTC_INFORMATION,
            &[SUB_READ_DTC_SNAPSHOT_IDENTIFICATION, status_mask],
        )?;
        if resp.len() < 3 {
            return Err(UdsError::UnexpectedResponse("short snapshot identification response".to_string()));
        }
        let body = &resp[3..];
        if body.len() % 3 != 0 {
            return Err(UdsError::UnexpectedResponse("snapshot identification body not a multiple of 3".to_string()));
        }
        Ok(body.chunks_exact(3).map(|c| (c[0], c[1], c[2])).collect())
    }

    /// `ReadDTCInformation` sub `0x05`: snapshot record by record number. Returns
    /// the full response body past `59 05` (`dtc_hi dtc_lo record_id param_count
    /// <entries>`).
    pub fn read_dtc_snapshot_record(&mut self, record_id: u8) -> UdsResult<Vec<u8>> {
        let resp = self.request(SID_READ_DTC_INFORMATION, &[SUB_READ_DTC_SNAPSHOT_RECORD, record_id])?;
        if resp.len() < 2 {
            return Err(UdsError::UnexpectedResponse("short snapshot record response".to_string()));
        }
        Ok(resp[2..].to_vec())
    }
}

/// A caller-supplied (or brand-supplied) key computation for [`crate::uds::UdsClient`]
/// security access. This crate ships no OEM unlock algorithm; callers
/// inject one, or supply an already-computed key directly.
pub trait SecurityAlgorithm {
    /// Computes the key for `seed` at `level` for `ecu`.
    fn compute_key(&self, seed: &[u8], level: u8, ecu: &str) -> Result<Vec<u8>, SecurityAlgoError>;
}

/// Errors a [`SecurityAlgorithm`] implementation may raise.
#[derive(Debug, thiserror::Error)]
pub enum SecurityAlgoError {
    /// The algorithm could not compute a key for the given seed (wrong length,
    /// unsupported level, internal failure).
    #[error("security algorithm failed: {0}")]
    ComputationFailed(String),
}

/// How the caller supplies the key for a [`security_unlock`] exchange:
/// either the key is already computed, or an algorithm collaborator computes it
/// from the ECU-supplied seed.
pub enum SecurityUnlock<'a> {
    /// An already-computed key.
    PrecomputedKey(Vec<u8>),
    /// An injected algorithm that computes the key from the seed.
    Algorithm(&'a dyn SecurityAlgorithm),
}

/// Performs the full `SecurityAccess` (`0x27`) seed/key exchange for `level`
/// against the client's active ECU.
pub fn security_unlock(uds: &mut UdsClient, level: u8, unlock: &SecurityUnlock, ecu: &str) -> UdsResult<()> {
    let seed = uds.security_access_request_seed(level)?;
    let key = match unlock {
        SecurityUnlock::PrecomputedKey(key) => key.clone(),
        SecurityUnlock::Algorithm(algo) => algo
            .compute_key(&seed, level, ecu)
            .map_err(|e| UdsError::UnexpectedResponse(e.to_string()))?,
    };
    uds.security_access_send_key(level, &key)
}
