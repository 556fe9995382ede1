#![deny(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unstable_features,
    unused_imports,
    unused_import_braces,
    unused_qualifications
)]

//! A crate which provides a UDS (ISO14229-1) diagnostic engine over ISO-TP (ISO15765-2),
//! plus the supporting stack a technician tool needs on top of it: ECU discovery,
//! DTC/DID/freeze-frame reading, dataset-driven adaptations and long-coding writes with
//! backup/revert safety, a live-watch tick loop, and a JSONL IPC server.
//!
//! ## Scope
//!
//! This crate owns the protocol engine and the safety-gated write stack. It deliberately
//! does not own:
//! * CLI/TUI frontends or argument parsing
//! * where logs are sent (it emits records via the [`log`] facade; the sink is a frontend concern)
//! * filesystem directory resolution (datasets/backups paths are passed in explicitly)
//! * interactive password prompting
//! * a concrete CAN hardware backend -- callers supply a [`can::CanTransport`]
//!
//! ## Layout
//!
//! * [`can`] / [`isotp`] -- the transport layer a UDS client is built on.
//! * [`uds`] -- the UDS request/response engine, including security access.
//! * [`dtc`], [`did`], [`freeze_frame`] -- the read-side codecs.
//! * [`topology`], [`discovery`] -- ECU addressing and bus scanning.
//! * [`brands`] -- per-brand ECU naming / DTC description overrides.
//! * [`datasets`] -- validated JSON packs describing adaptations and long-coding fields.
//! * [`backups`] -- the append-only write/snapshot record store.
//! * [`adaptations`], [`longcoding`] -- the mode-gated write engines.
//! * [`watch`] -- the live-watch tick loop.
//! * [`service`] -- [`service::DiagnosticService`], the single facade used by all frontends.
//! * [`ipc`] -- the JSONL unix-domain server built on top of the facade.
//! * [`credential`] -- the scrypt-gated unsafe-mode password check.
//! * [`sim`] -- an in-process simulated ECU, used by this crate's own tests.

pub mod adaptations;
pub mod backups;
pub mod brands;
pub mod can;
pub mod credential;
pub mod datasets;
pub mod discovery;
pub mod did;
pub mod dtc;
pub mod freeze_frame;
pub mod ipc;
pub mod isotp;
pub mod longcoding;
pub mod service;
pub mod sim;
pub mod topology;
pub mod uds;
pub mod watch;

/// The two CAN identifier addressing modes this crate understands.
///
/// `11bit` is classic CAN with physical request ids `0x7E0..=0x7F7` and response ids
/// `0x7E8..=0x7FF`. `29bit` is ISO-TP "normal fixed" addressing on extended CAN ids, with
/// the tester's source address fixed at `0xF1`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CanIdMode {
    /// Standard 11-bit CAN identifiers.
    Bit11,
    /// Extended 29-bit CAN identifiers (ISO-TP normal fixed addressing).
    Bit29,
}

impl CanIdMode {
    /// Parses the wire string representation (`"11bit"` / `"29bit"`) used throughout
    /// dataset packs, IPC payloads, and topology records.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "11bit" => Some(Self::Bit11),
            "29bit" => Some(Self::Bit29),
            _ => None,
        }
    }

    /// Returns the wire string representation used throughout dataset packs, IPC
    /// payloads, and topology records.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bit11 => "11bit",
            Self::Bit29 => "29bit",
        }
    }
}

impl std::fmt::Display for CanIdMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<CanIdMode> for String {
    fn from(mode: CanIdMode) -> Self {
        mode.as_str().to_string()
    }
}

impl TryFrom<String> for CanIdMode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        CanIdMode::parse(&value).ok_or_else(|| format!("unknown can_id_mode: {value:?}"))
    }
}

/// Tester source address used for 29-bit normal-fixed addressing.
pub const TESTER_SOURCE_ADDRESS_29: u8 = 0xF1;

/// Functional (broadcast) request id for 11-bit addressing.
pub const FUNCTIONAL_ID_11BIT: u32 = 0x7DF;

/// Functional (broadcast) request id for 29-bit addressing (tester SA = 0xF1).
pub const FUNCTIONAL_ID_29BIT: u32 = 0x18DB33F1;

/// Normalizes a user-supplied ECU address string (e.g. `"1"`, `"0x01"`, `"01"`) into the
/// canonical uppercase 2-hex-digit form used throughout this crate's data model, or
/// rejects it as a [`ValidationError`].
pub fn normalize_ecu(value: &str) -> Result<String, ValidationError> {
    let raw = value.trim();
    if raw.is_empty() {
        return Err(ValidationError::MalformedEcu(value.to_string()));
    }
    let raw = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .unwrap_or(raw);
    let ecu_int =
        u32::from_str_radix(raw, 16).map_err(|_| ValidationError::MalformedEcu(value.to_string()))?;
    if ecu_int > 0xFF {
        return Err(ValidationError::EcuOutOfRange(ecu_int));
    }
    Ok(format!("{:02X}", ecu_int))
}

/// Errors raised while validating caller-supplied identifiers (ECU addresses, DIDs,
/// hex payloads, enum/bit-field values) that do not belong to any single protocol layer.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    /// The string could not be parsed as a hex ECU address.
    #[error("ecu must be a hex string (got {0:?})")]
    MalformedEcu(String),
    /// The parsed ECU address exceeds the 8-bit address space.
    #[error("ecu out of range: 0x{0:X}")]
    EcuOutOfRange(u32),
    /// The string could not be parsed as a hex DID.
    #[error("did must be a hex string (got {0:?})")]
    MalformedDid(String),
    /// The parsed DID exceeds the 16-bit identifier space.
    #[error("did out of range: 0x{0:X}")]
    DidOutOfRange(u32),
    /// A hex payload string had odd length or contained non-hex characters.
    #[error("invalid hex payload: {0}")]
    InvalidHexPayload(String),
    /// A typed value failed validation (out of range, wrong format) for its declared kind.
    #[error("invalid value for kind {kind}: {reason}")]
    InvalidValue {
        /// The declared value kind (`bool`, `u8`, `u16`, `i16`, `enum`, `bytes`).
        kind: &'static str,
        /// Human-readable reason the value was rejected.
        reason: String,
    },
}

/// Parses a DID given either as a bare integer or a hex string (optionally `0x`-prefixed),
/// matching the permissive `did` field accepted throughout the IPC and dataset layers.
pub fn parse_did_str(value: &str) -> Result<u16, ValidationError> {
    let raw = value.trim();
    let raw = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .unwrap_or(raw);
    if raw.is_empty() {
        return Err(ValidationError::MalformedDid(value.to_string()));
    }
    let did =
        u32::from_str_radix(raw, 16).map_err(|_| ValidationError::MalformedDid(value.to_string()))?;
    if did > 0xFFFF {
        return Err(ValidationError::DidOutOfRange(did));
    }
    Ok(did as u16)
}

/// Parses an even-length hex string (optionally `0x`-prefixed) into bytes. An empty
/// string (after stripping the prefix) decodes to an empty byte vector.
pub fn parse_hex_payload(value: &str) -> Result<Vec<u8>, ValidationError> {
    let raw = value.trim();
    let raw = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .unwrap_or(raw);
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    if raw.len() % 2 != 0 {
        return Err(ValidationError::InvalidHexPayload(value.to_string()));
    }
    (0..raw.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&raw[i..i + 2], 16)
                .map_err(|_| ValidationError::InvalidHexPayload(value.to_string()))
        })
        .collect()
}

/// Formats bytes as an uppercase hex string with no separators, the convention used for
/// every `raw`/`*_hex` field in this crate's JSON output.
pub fn to_hex_upper(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_ecu_accepts_hex_forms() {
        assert_eq!(normalize_ecu("1").unwrap(), "01");
        assert_eq!(normalize_ecu("0x1A").unwrap(), "1A");
        assert_eq!(normalize_ecu("ff").unwrap(), "FF");
    }

    #[test]
    fn normalize_ecu_rejects_out_of_range() {
        assert!(normalize_ecu("100").is_err());
        assert!(normalize_ecu("").is_err());
    }

    #[test]
    fn parse_did_str_accepts_prefixed_and_bare() {
        assert_eq!(parse_did_str("F190").unwrap(), 0xF190);
        assert_eq!(parse_did_str("0xf190").unwrap(), 0xF190);
    }

    #[test]
    fn parse_hex_payload_round_trips() {
        let bytes = parse_hex_payload("0x01AB").unwrap();
        assert_eq!(bytes, vec![0x01, 0xAB]);
        assert_eq!(to_hex_upper(&bytes), "01AB");
    }

    #[test]
    fn parse_hex_payload_rejects_odd_length() {
        assert!(parse_hex_payload("0xABC").is_err());
    }
}
