//! Long-coding engine (C12): bit-field reads/writes against a single "coding
//! record" DID per ECU, gated the same way as [`crate::adaptations`].

use serde::{Deserialize, Serialize};

use crate::adaptations::WriteMode;
use crate::backups::{BackupError, BackupStore};
use crate::datasets::{CodingKind, DatasetPack, LongCodingFieldSpec, LongCodingProfile, Risk};
use crate::uds::{security_unlock, SecurityUnlock, UdsClient, UdsError};
use crate::ValidationError;

/// A typed long-coding field value, decoded per [`CodingKind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CodingValue {
    /// `kind == bool`.
    Bool(bool),
    /// `kind` in `{u8, enum}` with no matching label.
    Int(u8),
    /// `kind == enum`, matched against its label map.
    Text(String),
}

/// Before/after of one field within a [`WriteReport`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDiff {
    /// The field's stable key.
    pub key: String,
    /// Value before the write.
    pub old: CodingValue,
    /// Value after the write.
    pub new: CodingValue,
}

/// Result of a successful [`LongCodingManager::write`] call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteReport {
    /// Id of the backup record created before the write.
    pub backup_id: String,
    /// Uppercase hex of the full coding record before the write.
    pub old_raw: String,
    /// Uppercase hex of the full coding record after the write.
    pub new_raw: String,
    /// Just the fields whose decoded value actually changed.
    pub changed: Vec<FieldDiff>,
}

/// Errors raised by the long-coding engine.
#[derive(Debug, thiserror::Error)]
pub enum LongCodingError {
    /// No long-coding profile is loaded for the requested ECU.
    #[error("no long-coding profile for ecu {0:?}")]
    UnknownEcu(String),
    /// The profile has no field with the requested key.
    #[error("unknown long-coding field {0:?}")]
    UnknownField(String),
    /// `mode` does not permit writing a field of this `risk` classification, or
    /// `mode == safe` (long-coding is always read-only in `safe` mode).
    #[error("mode {mode:?} does not allow writing a {risk:?} field")]
    ModeDenied {
        /// The mode the write was attempted under.
        mode: WriteMode,
        /// The field's risk classification.
        risk: Risk,
    },
    /// The ECU's coding record was not the profile's declared length, before or
    /// after the write.
    #[error("coding record for ecu {ecu:?} has length {actual}, expected {expected}")]
    LengthMismatch {
        /// The ECU the record was read from.
        ecu: String,
        /// The length the profile declares.
        expected: u16,
        /// The length actually read back.
        actual: usize,
    },
    /// A security-access-family negative response was returned; the caller must
    /// authenticate and retry.
    #[error("security access required: {0}")]
    NeedsAuth(#[source] UdsError),
    /// The ECU rejected the request for a non-security reason.
    #[error(transparent)]
    Uds(#[from] UdsError),
    /// The caller-supplied value did not fit the field's declared kind.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// The backup store failed to persist a record.
    #[error(transparent)]
    Backup(#[from] BackupError),
}

fn classify_uds(e: UdsError) -> LongCodingError {
    if e.is_security() {
        LongCodingError::NeedsAuth(e)
    } else {
        LongCodingError::Uds(e)
    }
}

fn coding_did(profile: &LongCodingProfile, field: &LongCodingFieldSpec) -> Result<u16, ValidationError> {
    match field.did {
        Some(did) => Ok(did),
        None => crate::parse_did_str(&profile.did),
    }
}

fn coding_length(profile: &LongCodingProfile, field: &LongCodingFieldSpec) -> u16 {
    field.coding_length.unwrap_or(profile.length)
}

/// Extracts the `field.len`-bit value starting at bit `field.bit` of
/// `record[field.byte]`, then decodes it per `field.kind`.
fn decode_field(field: &LongCodingFieldSpec, record: &[u8]) -> CodingValue {
    let byte = record[field.byte as usize];
    let mask: u8 = ((1u16 << field.len) - 1) as u8;
    let raw = (byte >> field.bit) & mask;
    match field.kind {
        CodingKind::Bool => CodingValue::Bool(raw != 0),
        CodingKind::U8 => CodingValue::Int(raw),
        CodingKind::Enum => match field.r#enum.as_ref().and_then(|m| m.get(&(raw as i64).to_string())) {
            Some(label) => CodingValue::Text(label.clone()),
            None => CodingValue::Int(raw),
        },
    }
}

/// Encodes `value` into a `field.len`-bit code, range-checked against the field's
/// declared width.
fn encode_field(field: &LongCodingFieldSpec, value: &str) -> Result<u8, ValidationError> {
    let max: u8 = ((1u16 << field.len) - 1) as u8;
    let value = value.trim();
    let code = match field.kind {
        CodingKind::Bool => match value.to_ascii_lowercase().as_str() {
            "true" | "1" | "on" => 1u8,
            "false" | "0" | "off" => 0u8,
            _ => {
                return Err(ValidationError::InvalidValue {
                    kind: "bool",
                    reason: format!("expected true/false, got {value:?}"),
                })
            }
        },
        CodingKind::U8 => value.parse::<u8>().map_err(|_| ValidationError::InvalidValue {
            kind: "u8",
            reason: format!("expected an integer, got {value:?}"),
        })?,
        CodingKind::Enum => encode_enum_code(field, value)?,
    };
    if code > max {
        return Err(ValidationError::InvalidValue {
            kind: "u8",
            reason: format!("value {code} does not fit in a {len}-bit field", len = field.len),
        });
    }
    Ok(code)
}

fn encode_enum_code(field: &LongCodingFieldSpec, value: &str) -> Result<u8, ValidationError> {
    if let Ok(code) = value.parse::<u8>() {
        if field.r#enum.as_ref().map(|m| m.contains_key(&(code as i64).to_string())).unwrap_or(true) {
            return Ok(code);
        }
    }
    if let Some(map) = &field.r#enum {
        for (code, label) in map {
            if label.eq_ignore_ascii_case(value) {
                let code: u8 = code.parse().map_err(|_| ValidationError::InvalidValue {
                    kind: "enum",
                    reason: format!("enum map has non-numeric key {code:?}"),
                })?;
                return Ok(code);
            }
        }
    }
    Err(ValidationError::InvalidValue {
        kind: "enum",
        reason: format!("{value:?} is not a known label or value for this field"),
    })
}

/// Sets bits `[field.bit..field.bit+field.len)` of `record[field.byte]` to `code`,
/// leaving every other bit untouched.
fn apply_field(field: &LongCodingFieldSpec, record: &mut [u8], code: u8) {
    let mask: u8 = ((1u16 << field.len) - 1) as u8;
    let byte = &mut record[field.byte as usize];
    *byte &= !(mask << field.bit);
    *byte |= (code & mask) << field.bit;
}

/// Owns one brand's loaded dataset pack and performs mode-gated long-coding
/// bit-field reads/writes against it.
#[derive(Debug)]
pub struct LongCodingManager {
    pack: DatasetPack,
}

impl LongCodingManager {
    /// Wraps an already-loaded dataset pack.
    pub fn new(pack: DatasetPack) -> Self {
        Self { pack }
    }

    fn profile(&self, ecu: &str) -> Result<&LongCodingProfile, LongCodingError> {
        self.pack
            .longcoding_for(ecu)
            .ok_or_else(|| LongCodingError::UnknownEcu(ecu.to_string()))
    }

    fn resolve(&self, ecu: &str, key: &str) -> Result<(&LongCodingProfile, &LongCodingFieldSpec), LongCodingError> {
        let profile = self.profile(ecu)?;
        let field = profile
            .fields
            .iter()
            .find(|f| f.key == key)
            .ok_or_else(|| LongCodingError::UnknownField(key.to_string()))?;
        Ok((profile, field))
    }

    /// Lists the fields available for `ecu`.
    pub fn list(&self, ecu: &str) -> Result<&[LongCodingFieldSpec], LongCodingError> {
        self.profile(ecu).map(|p| p.fields.as_slice())
    }

    fn read_record(&self, uds: &mut UdsClient, ecu: &str, profile: &LongCodingProfile) -> Result<Vec<u8>, LongCodingError> {
        let did = crate::parse_did_str(&profile.did)?;
        let raw = uds.read_data_by_identifier(did).map_err(classify_uds)?;
        if raw.len() != profile.length as usize {
            return Err(LongCodingError::LengthMismatch {
                ecu: ecu.to_string(),
                expected: profile.length,
                actual: raw.len(),
            });
        }
        Ok(raw)
    }

    /// Reads the coding record and decodes every field (always allowed, even in
    /// `safe` mode).
    pub fn read_all(&self, uds: &mut UdsClient, ecu: &str) -> Result<Vec<(String, CodingValue)>, LongCodingError> {
        let profile = self.profile(ecu)?;
        let record = self.read_record(uds, ecu, profile)?;
        Ok(profile
            .fields
            .iter()
            .map(|f| (f.key.clone(), decode_field(f, &record)))
            .collect())
    }

    /// Reads the coding record and decodes a single field.
    pub fn read(&self, uds: &mut UdsClient, ecu: &str, key: &str) -> Result<CodingValue, LongCodingError> {
        let (profile, field) = self.resolve(ecu, key)?;
        let record = self.read_record(uds, ecu, profile)?;
        Ok(decode_field(field, &record))
    }

    /// Writes a single field within the coding record, per the read/set-bits/
    /// write/readback cycle. `safe` mode never permits a long-coding
    /// write, regardless of the field's risk classification.
    pub fn write(
        &self,
        uds: &mut UdsClient,
        backups: &BackupStore,
        ecu: &str,
        key: &str,
        value: &str,
        mode: WriteMode,
        security: Option<(u8, &SecurityUnlock<'_>)>,
    ) -> Result<WriteReport, LongCodingError> {
        let (profile, field) = self.resolve(ecu, key)?;
        if mode == WriteMode::Safe || !mode.allows(field.risk) {
            return Err(LongCodingError::ModeDenied { mode, risk: field.risk });
        }

        let did = coding_did(profile, field)?;
        let expected_len = coding_length(profile, field);
        let old_record = self.read_record(uds, ecu, profile)?;
        let code = encode_field(field, value)?;
        let mut new_record = old_record.clone();
        apply_field(field, &mut new_record, code);

        let backup = backups.create_did_write(
            ecu,
            did,
            Some(&field.key),
            &crate::to_hex_upper(&old_record),
            &crate::to_hex_upper(&new_record),
        )?;

        if field.needs_security_access {
            let (level, unlock) = security.ok_or_else(|| {
                LongCodingError::NeedsAuth(UdsError::UnexpectedResponse(
                    "security access required but no credentials supplied".to_string(),
                ))
            })?;
            security_unlock(uds, level, unlock, ecu).map_err(classify_uds)?;
        }

        uds.write_data_by_identifier(did, &new_record).map_err(classify_uds)?;
        let readback = uds.read_data_by_identifier(did).map_err(classify_uds)?;
        if readback.len() != expected_len as usize {
            return Err(LongCodingError::LengthMismatch {
                ecu: ecu.to_string(),
                expected: expected_len,
                actual: readback.len(),
            });
        }

        let changed: Vec<FieldDiff> = profile
            .fields
            .iter()
            .filter_map(|f| {
                let old = decode_field(f, &old_record);
                let new = decode_field(f, &readback);
                if old != new {
                    Some(FieldDiff { key: f.key.clone(), old, new })
                } else {
                    None
                }
            })
            .collect();

        log::info!("long-coding field {key:?} written for ecu={ecu} (backup {})", backup.backup_id);

        Ok(WriteReport {
            backup_id: backup.backup_id,
            old_raw: crate::to_hex_upper(&old_record),
            new_raw: crate::to_hex_upper(&readback),
            changed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{ChannelPair, SimEcu};
    use crate::CanIdMode;

    fn pack_with_drl_bit() -> DatasetPack {
        let dir = std::env::temp_dir().join(format!("uds_diag_core_lc_test_{}", std::process::id()));
        let brand_dir = dir.join("acme");
        std::fs::create_dir_all(brand_dir.join("longcoding")).unwrap();
        std::fs::write(
            brand_dir.join("manifest.json"),
            r#"{"brand":"acme","version":"1.0","type":"datasets"}"#,
        )
        .unwrap();
        std::fs::write(
            brand_dir.join("longcoding/01.json"),
            r#"{"ecu":"01","ecu_name":"Engine","did":"1234","length":2,"fields":[
                {"key":"drl_bit","label":"DRL enable","kind":"bool","risk":"safe",
                 "byte":0,"bit":0,"len":1,"needs_security_access":false},
                {"key":"wiper_speed","label":"Wiper speed","kind":"u8","risk":"risky",
                 "byte":0,"bit":1,"len":3,"needs_security_access":false}
            ]}"#,
        )
        .unwrap();
        DatasetPack::load(&dir, "acme").unwrap()
    }

    #[test]
    fn decode_and_encode_bit_field_round_trip() {
        let pack = pack_with_drl_bit();
        let manager = LongCodingManager::new(pack);
        let field = &manager.list("01").unwrap()[0];
        assert_eq!(decode_field(field, &[0b0000_0001, 0x00]), CodingValue::Bool(true));
        assert_eq!(decode_field(field, &[0b0000_0000, 0x00]), CodingValue::Bool(false));
        let code = encode_field(field, "true").unwrap();
        assert_eq!(code, 1);
    }

    #[test]
    fn multi_bit_field_extracts_correct_mask() {
        let pack = pack_with_drl_bit();
        let manager = LongCodingManager::new(pack);
        let field = &manager.list("01").unwrap()[1];
        // bits 1..4 of 0b0000_1011 == 0b101 == 5
        assert_eq!(decode_field(field, &[0b0000_1011, 0x00]), CodingValue::Int(5));
    }

    #[test]
    fn encode_field_rejects_values_that_overflow_the_bit_width() {
        let pack = pack_with_drl_bit();
        let manager = LongCodingManager::new(pack);
        let field = &manager.list("01").unwrap()[1];
        assert!(encode_field(field, "8").is_err());
        assert!(encode_field(field, "7").is_ok());
    }

    struct NeverCalledTransport;
    impl crate::can::CanTransport for NeverCalledTransport {
        fn send(&mut self, _can_id: u32, _data: &[u8]) -> crate::can::TransportResult<()> {
            panic!("mode-denied write must never touch the transport");
        }
        fn recv(&mut self, _timeout_ms: u32) -> crate::can::TransportResult<Option<crate::can::CanFrame>> {
            panic!("mode-denied write must never touch the transport");
        }
        fn close(&mut self) -> crate::can::TransportResult<()> {
            Ok(())
        }
    }

    #[test]
    fn write_in_safe_mode_is_rejected_even_for_a_safe_field() {
        let pack = pack_with_drl_bit();
        let manager = LongCodingManager::new(pack);
        let backups_dir = std::env::temp_dir().join(format!("uds_diag_core_lc_backups_{}", std::process::id()));
        let backups = BackupStore::new(&backups_dir).unwrap();

        let mut transport = NeverCalledTransport;
        let mut uds = UdsClient::new(&mut transport, "01", CanIdMode::Bit11).unwrap();

        let err = manager
            .write(&mut uds, &backups, "01", "drl_bit", "true", WriteMode::Safe, None)
            .unwrap_err();
        assert!(matches!(err, LongCodingError::ModeDenied { .. }));

        std::fs::remove_dir_all(&backups_dir).ok();
    }

    #[test]
    fn write_round_trip_reports_only_changed_fields() {
        let pack = pack_with_drl_bit();
        let manager = LongCodingManager::new(pack);
        let backups_dir = std::env::temp_dir().join(format!("uds_diag_core_lc_write_backups_{}", std::process::id()));
        let backups = BackupStore::new(&backups_dir).unwrap();

        let (mut tester, ecu_side) = ChannelPair::new();
        let current = std::sync::Arc::new(std::sync::Mutex::new(vec![0x00u8, 0x00]));
        let current_for_ecu = current.clone();
        let sim = SimEcu::spawn(ecu_side, 0x7E1, 0x7E9, move |req| match req.first() {
            Some(0x22) if req.get(1) == Some(&0x12) && req.get(2) == Some(&0x34) => {
                let v = current_for_ecu.lock().unwrap().clone();
                Some([vec![0x62, 0x12, 0x34], v].concat())
            }
            Some(0x2E) if req.get(1) == Some(&0x12) && req.get(2) == Some(&0x34) => {
                *current_for_ecu.lock().unwrap() = req[3..].to_vec();
                Some(vec![0x6E, 0x12, 0x34])
            }
            _ => None,
        });

        let mut uds = UdsClient::new(&mut tester, "01", CanIdMode::Bit11).unwrap();
        let report = manager
            .write(&mut uds, &backups, "01", "drl_bit", "true", WriteMode::Advanced, None)
            .unwrap();
        assert_eq!(report.changed.len(), 1);
        assert_eq!(report.changed[0].key, "drl_bit");
        assert_eq!(report.changed[0].old, CodingValue::Bool(false));
        assert_eq!(report.changed[0].new, CodingValue::Bool(true));

        drop(uds);
        sim.join();
        std::fs::remove_dir_all(&backups_dir).ok();
    }
}
