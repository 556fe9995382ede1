//! ECU addressing and topology data model (part of C7).
//!
//! [`ids_for_ecu`] and [`infer_ecu_from_response_id`] are the two pure functions the
//! discovery scanner and the UDS client both depend on for CAN id derivation -- kept
//! here, not duplicated, so both have one home for the id-derivation formulas.

use crate::{CanIdMode, TESTER_SOURCE_ADDRESS_29};

/// A discovered (or assumed) ECU on the bus.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EcuNode {
    /// Uppercase 2-hex ECU address, e.g. `"01"`.
    pub ecu: String,
    /// Physical request CAN id for this ECU.
    pub tx_id: u32,
    /// Physical response CAN id for this ECU.
    pub rx_id: u32,
    /// Addressing mode these ids were derived under.
    pub can_id_mode: CanIdMode,
    /// Whether a positive `DiagnosticSessionControl` response was observed for this ECU.
    pub uds_confirmed: bool,
    /// Resolved display name (brand override, or `"Unknown ECU"`).
    pub ecu_name: String,
    /// Sorted, de-duplicated set of how this node was observed (`"seen:functional"`, `"seen:physical"`).
    pub notes: Vec<String>,
}

impl EcuNode {
    /// Returns the default-named node for `ecu`/`can_id_mode` with no notes and
    /// `uds_confirmed = false`; the discovery scanner fills in the rest.
    pub fn new(ecu: &str, can_id_mode: CanIdMode) -> Result<Self, crate::ValidationError> {
        let (tx_id, rx_id) = ids_for_ecu(ecu, can_id_mode)?;
        Ok(Self {
            ecu: ecu.to_string(),
            tx_id,
            rx_id,
            can_id_mode,
            uds_confirmed: false,
            ecu_name: "Unknown ECU".to_string(),
            notes: Vec::new(),
        })
    }
}

/// A full bus scan result: every discovered [`EcuNode`], sorted by ECU address.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Topology {
    /// Descriptive name of the CAN interface the scan ran on (not used for addressing).
    pub can_interface: String,
    /// Addressing mode used for the scan.
    pub can_id_mode: CanIdMode,
    /// Which addressing strategy (`"functional"`, `"physical"`, `"both"`) produced this topology.
    pub addressing: String,
    /// Discovered nodes, sorted by [`EcuNode::ecu`].
    pub nodes: Vec<EcuNode>,
}

/// Derives the physical `(tx_id, rx_id)` pair for `ecu` under `can_id_mode`, per the
/// invariants here: 11-bit is `0x7E0+e / 0x7E8+e` (restricted to `e <= 0x17` so the
/// response id stays within the 11-bit range); 29-bit is ISO-TP normal-fixed
/// addressing with the tester source address fixed at [`TESTER_SOURCE_ADDRESS_29`].
pub fn ids_for_ecu(ecu: &str, can_id_mode: CanIdMode) -> Result<(u32, u32), crate::ValidationError> {
    let ecu_int = u32::from_str_radix(ecu, 16).map_err(|_| crate::ValidationError::MalformedEcu(ecu.to_string()))?;
    if ecu_int > 0xFF {
        return Err(crate::ValidationError::EcuOutOfRange(ecu_int));
    }
    match can_id_mode {
        CanIdMode::Bit11 => {
            if ecu_int > 0x17 {
                return Err(crate::ValidationError::EcuOutOfRange(ecu_int));
            }
            Ok((0x7E0 + ecu_int, 0x7E8 + ecu_int))
        }
        CanIdMode::Bit29 => {
            let sa = TESTER_SOURCE_ADDRESS_29 as u32;
            let tx_id = 0x18DA0000 | ((ecu_int & 0xFF) << 8) | sa;
            let rx_id = 0x18DA0000 | (sa << 8) | (ecu_int & 0xFF);
            Ok((tx_id, rx_id))
        }
    }
}

/// Infers the ECU address from a response CAN id, the inverse of [`ids_for_ecu`]'s
/// `rx_id` half. Returns `None` if `can_id` does not look like a physical response
/// id under `can_id_mode` (used by discovery to filter bus noise).
pub fn infer_ecu_from_response_id(can_id: u32, can_id_mode: CanIdMode) -> Option<String> {
    match can_id_mode {
        CanIdMode::Bit11 => {
            if (0x7E8..=0x7FF).contains(&can_id) {
                Some(format!("{:02X}", can_id - 0x7E8))
            } else {
                None
            }
        }
        CanIdMode::Bit29 => {
            if can_id & 0x1FFFFF00 == 0x18DAF100 {
                Some(format!("{:02X}", can_id & 0xFF))
            } else {
                None
            }
        }
    }
}
