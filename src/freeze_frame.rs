//! Freeze-frame reader (C6): `ReadDTCInformation` sub `0x04`/`0x05` snapshot
//! identification and record decode.

use crate::did::{self, DidValue};
use crate::dtc::format_code;
use crate::uds::UdsClient;

/// One decoded parameter within a [`FreezeFrame`] record.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FreezeFrameParam {
    /// Resolved display name (freeze-frame table, then general registry, then
    /// synthesized `"DID <HHHH>"`).
    pub name: String,
    /// The DID this parameter was read from.
    pub did: u16,
    /// Uppercase hex of the raw bytes.
    pub raw: String,
    /// Decoded value, or raw hex if decoding degraded.
    pub value: DidValue,
    /// Unit string, empty if unknown/dimensionless.
    pub unit: String,
}

/// A single freeze-frame snapshot: the DTC it was captured for, which record
/// number, and its decoded parameters.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FreezeFrame {
    /// Formatted DTC code the snapshot was captured for.
    pub dtc: String,
    /// Snapshot record number.
    pub record_id: u8,
    /// Decoded parameters, in wire order.
    pub parameters: Vec<FreezeFrameParam>,
}

/// Errors raised while parsing a raw snapshot record. Individual parameter decode
/// failures never reach this type (: they degrade to raw hex); this type is
/// for malformed framing (length overruns, truncated entries).
#[derive(Debug, thiserror::Error)]
pub enum FreezeFrameError {
    /// A parameter's declared length ran past the end of the record.
    #[error("freeze frame parameter length overrun: declared {declared}, remaining {remaining}")]
    LengthOverrun {
        /// The length byte the ECU declared for this parameter.
        declared: usize,
        /// Bytes actually remaining in the record.
        remaining: usize,
    },
    /// The record was too short to contain its own header.
    #[error("freeze frame record too short")]
    ShortRecord,
}

/// Parses a raw snapshot record body (`dtc_hi dtc_lo record_id param_count
/// <entries>`, as returned past `59 05` by [`UdsClient::read_dtc_snapshot_record`])
/// into a [`FreezeFrame`].
pub fn parse_snapshot_record(body: &[u8]) -> Result<FreezeFrame, FreezeFrameError> {
    if body.len() < 4 {
        return Err(FreezeFrameError::ShortRecord);
    }
    let dtc16 = ((body[0] as u16) << 8) | body[1] as u16;
    let record_id = body[2];
    let param_count = body[3] as usize;

    let mut offset = 4;
    let mut parameters = Vec::with_capacity(param_count);
    for _ in 0..param_count {
        if body.len() < offset + 3 {
            return Err(FreezeFrameError::ShortRecord);
        }
        let param_did = ((body[offset] as u16) << 8) | body[offset + 1] as u16;
        let len = body[offset + 2] as usize;
        offset += 3;
        if body.len() < offset + len {
            return Err(FreezeFrameError::LengthOverrun {
                declared: len,
                remaining: body.len() - offset,
            });
        }
        let raw = &body[offset..offset + len];
        offset += len;

        let (name, value) = match did::lookup_for_freeze_frame(param_did) {
            Some(spec) => (spec.name.to_string(), did::decode(spec, raw)),
            None => did::decode_unregistered(param_did, raw),
        };
        let unit = did::lookup_for_freeze_frame(param_did).map(|s| s.unit.to_string()).unwrap_or_default();
        parameters.push(FreezeFrameParam {
            name,
            did: param_did,
            raw: crate::to_hex_upper(raw),
            value,
            unit,
        });
    }

    Ok(FreezeFrame {
        dtc: format_code(dtc16),
        record_id,
        parameters,
    })
}

/// Reads every freeze-frame snapshot for `dtc_code16`, best-effort: any failure
/// (negative response, transport error, malformed record) for the identification
/// read or for an individual record read degrades that record to being skipped
/// rather than propagating -- callers that need an all-or-nothing read
/// should call [`UdsClient::read_dtc_snapshot_identification`]/
/// [`UdsClient::read_dtc_snapshot_record`] directly instead.
pub fn read_snapshots_for_dtc(uds: &mut UdsClient, dtc_code16: u16, status_mask: u8) -> Vec<FreezeFrame> {
    let Ok(identification) = uds.read_dtc_snapshot_identification(status_mask) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for (hi, lo, record_id) in identification {
        let code16 = ((hi as u16) << 8) | lo as u16;
        if code16 != dtc_code16 {
            continue;
        }
        let Ok(body) = uds.read_dtc_snapshot_record(record_id) else {
            continue;
        };
        if let Ok(frame) = parse_snapshot_record(&body) {
            out.push(frame);
        }
    }
    out
}
