//! Mode-gated adaptations engine (C11): read/write individual dataset-described
//! settings through a fixed write state machine (validate, read old, encode
//! new, backup, write, readback, report).

use serde::{Deserialize, Serialize};

use crate::backups::{BackupError, BackupRecord, BackupStore};
use crate::datasets::{AdaptKind, AdaptSettingSpec, DatasetPack, Risk};
use crate::uds::{security_unlock, SecurityUnlock, UdsClient, UdsError};
use crate::ValidationError;

/// The three write modes a caller may operate the adaptations/long-coding engines
/// under. Ordered from most to least restrictive.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Only [`Risk::Safe`] settings may be written; reads are always allowed.
    Safe,
    /// [`Risk::Safe`] and [`Risk::Risky`] settings may be written.
    Advanced,
    /// Any setting may be written, subject to the credential gate.
    Unsafe,
}

impl WriteMode {
    /// `true` if this mode permits writing a setting classified at `risk`.
    pub fn allows(self, risk: Risk) -> bool {
        match self {
            WriteMode::Safe => risk == Risk::Safe,
            WriteMode::Advanced => risk != Risk::Unsafe,
            WriteMode::Unsafe => true,
        }
    }
}

/// A typed adaptation value, decoded per [`AdaptKind`] or degraded to [`AdaptValue::Hex`]
/// when the raw bytes don't fit the declared kind's length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AdaptValue {
    /// `kind == bool`.
    Bool(bool),
    /// `kind` in `{u8, u16, i16}`, or `kind == enum` with no matching label.
    Int(i64),
    /// `kind == enum`, matched against its label map.
    Text(String),
    /// Raw hex, used for `kind == bytes` and as the degrade-don't-fail fallback.
    Hex(String),
}

/// One half (before or after) of a [`WriteReport`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueSnapshot {
    /// Uppercase hex of the raw bytes.
    pub raw: String,
    /// Decoded value.
    pub value: AdaptValue,
}

/// Result of a successful [`AdaptationsManager::write`] or
/// [`AdaptationsManager::write_raw`] call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteReport {
    /// Id of the backup record created before the write.
    pub backup_id: String,
    /// Value read back before the write.
    pub old: ValueSnapshot,
    /// Value read back after the write.
    pub new: ValueSnapshot,
    /// The mode the write was performed under.
    pub mode: WriteMode,
}

/// Result of [`AdaptationsManager::revert`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevertReport {
    /// The backup record that was restored.
    pub backup_id: String,
    /// Uppercase hex of the value written back.
    pub restored_raw: String,
}

/// Errors raised by the adaptations engine.
#[derive(Debug, thiserror::Error)]
pub enum AdaptationsError {
    /// No adaptations profile is loaded for the requested ECU.
    #[error("no adaptations profile for ecu {0:?}")]
    UnknownEcu(String),
    /// The profile has no setting with the requested key.
    #[error("unknown adaptation setting {0:?}")]
    UnknownSetting(String),
    /// `mode` does not permit writing a setting of this `risk` classification.
    #[error("mode {mode:?} does not allow writing a {risk:?} setting")]
    ModeDenied {
        /// The mode the write was attempted under.
        mode: WriteMode,
        /// The setting's risk classification.
        risk: Risk,
    },
    /// The ECU responded to the write (or a preceding security access exchange)
    /// with a security-access-family negative response; the caller must
    /// authenticate and retry.
    #[error("security access required: {0}")]
    NeedsAuth(#[source] UdsError),
    /// The ECU rejected the request for a non-security reason.
    #[error(transparent)]
    Uds(#[from] UdsError),
    /// The caller-supplied value did not fit the setting's declared kind.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// The backup store failed to persist or load a record.
    #[error(transparent)]
    Backup(#[from] BackupError),
    /// [`AdaptationsManager::revert`] was asked to restore a backup that is not
    /// a `did_write` record.
    #[error("backup {0:?} is not a revertable did_write record")]
    NotRevertable(String),
}

fn classify_uds(e: UdsError) -> AdaptationsError {
    if e.is_security() {
        AdaptationsError::NeedsAuth(e)
    } else {
        AdaptationsError::Uds(e)
    }
}

/// Decodes `raw` per `spec.kind`. Degrades to [`AdaptValue::Hex`] rather than
/// failing when the byte length does not match the declared kind.
pub fn decode_adapt_value(spec: &AdaptSettingSpec, raw: &[u8]) -> AdaptValue {
    match spec.kind {
        AdaptKind::Bool if raw.len() == 1 => AdaptValue::Bool(raw[0] != 0),
        AdaptKind::U8 if raw.len() == 1 => AdaptValue::Int(raw[0] as i64),
        AdaptKind::U16 if raw.len() == 2 => AdaptValue::Int((((raw[0] as u16) << 8) | raw[1] as u16) as i64),
        AdaptKind::I16 if raw.len() == 2 => {
            AdaptValue::Int((((raw[0] as u16) << 8) | raw[1] as u16) as i16 as i64)
        }
        AdaptKind::Enum if raw.len() == 1 => {
            let code = raw[0] as i64;
            match spec.r#enum.as_ref().and_then(|m| m.get(&code.to_string())) {
                Some(label) => AdaptValue::Text(label.clone()),
                None => AdaptValue::Int(code),
            }
        }
        AdaptKind::Bytes => AdaptValue::Hex(crate::to_hex_upper(raw)),
        _ => AdaptValue::Hex(crate::to_hex_upper(raw)),
    }
}

/// Encodes `value` per `spec.kind` into wire bytes, rejecting out-of-range or
/// malformed input.
pub fn encode_adapt_value(spec: &AdaptSettingSpec, value: &str) -> Result<Vec<u8>, ValidationError> {
    let value = value.trim();
    match spec.kind {
        AdaptKind::Bool => match value.to_ascii_lowercase().as_str() {
            "true" | "1" | "on" => Ok(vec![0x01]),
            "false" | "0" | "off" => Ok(vec![0x00]),
            _ => Err(ValidationError::InvalidValue {
                kind: "bool",
                reason: format!("expected true/false, got {value:?}"),
            }),
        },
        AdaptKind::U8 => value
            .parse::<u8>()
            .map(|b| vec![b])
            .map_err(|_| ValidationError::InvalidValue {
                kind: "u8",
                reason: format!("expected an integer 0..=255, got {value:?}"),
            }),
        AdaptKind::U16 => value
            .parse::<u16>()
            .map(|v| v.to_be_bytes().to_vec())
            .map_err(|_| ValidationError::InvalidValue {
                kind: "u16",
                reason: format!("expected an integer 0..=65535, got {value:?}"),
            }),
        AdaptKind::I16 => value
            .parse::<i16>()
            .map(|v| v.to_be_bytes().to_vec())
            .map_err(|_| ValidationError::InvalidValue {
                kind: "i16",
                reason: format!("expected an integer -32768..=32767, got {value:?}"),
            }),
        AdaptKind::Enum => encode_enum_value(spec, value),
        AdaptKind::Bytes => crate::parse_hex_payload(value),
    }
}

fn encode_enum_value(spec: &AdaptSettingSpec, value: &str) -> Result<Vec<u8>, ValidationError> {
    let map = spec.r#enum.as_ref();
    if let Ok(code) = value.parse::<u8>() {
        if map.map(|m| m.contains_key(&code.to_string())).unwrap_or(true) {
            return Ok(vec![code]);
        }
    }
    if let Some(map) = map {
        for (code, label) in map {
            if label.eq_ignore_ascii_case(value) {
                let code: u8 = code.parse().map_err(|_| ValidationError::InvalidValue {
                    kind: "enum",
                    reason: format!("enum map has non-numeric key {code:?}"),
                })?;
                return Ok(vec![code]);
            }
        }
    }
    Err(ValidationError::InvalidValue {
        kind: "enum",
        reason: format!("{value:?} is not a known label or value for this setting"),
    })
}

/// Owns one brand's loaded dataset pack and performs mode-gated adaptation
/// reads/writes against it. Stateless across calls beyond the pack
/// itself; the backup store and UDS client are borrowed per call.
#[derive(Debug)]
pub struct AdaptationsManager {
    pack: DatasetPack,
}

impl AdaptationsManager {
    /// Wraps an already-loaded dataset pack.
    pub fn new(pack: DatasetPack) -> Self {
        Self { pack }
    }

    fn resolve(&self, ecu: &str, key: &str) -> Result<&AdaptSettingSpec, AdaptationsError> {
        let profile = self
            .pack
            .adaptations_for(ecu)
            .ok_or_else(|| AdaptationsError::UnknownEcu(ecu.to_string()))?;
        profile
            .settings
            .iter()
            .find(|s| s.key == key)
            .ok_or_else(|| AdaptationsError::UnknownSetting(key.to_string()))
    }

    /// Lists the settings available for `ecu`.
    pub fn list(&self, ecu: &str) -> Result<&[AdaptSettingSpec], AdaptationsError> {
        self.pack
            .adaptations_for(ecu)
            .map(|p| p.settings.as_slice())
            .ok_or_else(|| AdaptationsError::UnknownEcu(ecu.to_string()))
    }

    /// Reads and decodes the current value of `key`. Reads are never mode-gated.
    pub fn read(&self, uds: &mut UdsClient, ecu: &str, key: &str) -> Result<ValueSnapshot, AdaptationsError> {
        let spec = self.resolve(ecu, key)?.clone();
        let raw = uds.read_data_by_identifier(spec.read.id).map_err(classify_uds)?;
        Ok(ValueSnapshot {
            raw: crate::to_hex_upper(&raw),
            value: decode_adapt_value(&spec, &raw),
        })
    }

    /// Performs the full validate/read/encode/backup/write/readback cycle for a
    /// dataset-described setting. `security` is required whenever
    /// `spec.needs_security_access` is set; the exchange runs after the backup is
    /// recorded and before the write, per the state machine.
    pub fn write(
        &self,
        uds: &mut UdsClient,
        backups: &BackupStore,
        ecu: &str,
        key: &str,
        value: &str,
        mode: WriteMode,
        security: Option<(u8, &SecurityUnlock<'_>)>,
    ) -> Result<WriteReport, AdaptationsError> {
        let spec = self.resolve(ecu, key)?.clone();
        if !mode.allows(spec.risk) {
            return Err(AdaptationsError::ModeDenied { mode, risk: spec.risk });
        }

        let old_raw = uds.read_data_by_identifier(spec.read.id).map_err(classify_uds)?;
        let new_raw = encode_adapt_value(&spec, value)?;

        let backup = backups.create_did_write(
            ecu,
            spec.write.id,
            Some(&spec.key),
            &crate::to_hex_upper(&old_raw),
            &crate::to_hex_upper(&new_raw),
        )?;

        if spec.needs_security_access {
            let (level, unlock) = security.ok_or_else(|| {
                AdaptationsError::NeedsAuth(UdsError::UnexpectedResponse(
                    "security access required but no credentials supplied".to_string(),
                ))
            })?;
            security_unlock(uds, level, unlock, ecu).map_err(classify_uds)?;
        }

        uds.write_data_by_identifier(spec.write.id, &new_raw).map_err(classify_uds)?;
        let readback_raw = uds.read_data_by_identifier(spec.read.id).map_err(classify_uds)?;

        log::info!("adaptation {key:?} written for ecu={ecu} (backup {})", backup.backup_id);

        Ok(WriteReport {
            backup_id: backup.backup_id,
            old: ValueSnapshot {
                raw: crate::to_hex_upper(&old_raw),
                value: decode_adapt_value(&spec, &old_raw),
            },
            new: ValueSnapshot {
                raw: crate::to_hex_upper(&readback_raw),
                value: decode_adapt_value(&spec, &readback_raw),
            },
            mode,
        })
    }

    /// Writes a raw hex payload to `did` without consulting the dataset.
    /// Requires [`WriteMode::Unsafe`]; still records a `did_write` backup.
    pub fn write_raw(
        &self,
        uds: &mut UdsClient,
        backups: &BackupStore,
        ecu: &str,
        did: u16,
        raw_hex: &str,
        mode: WriteMode,
    ) -> Result<WriteReport, AdaptationsError> {
        if mode != WriteMode::Unsafe {
            return Err(AdaptationsError::ModeDenied { mode, risk: Risk::Unsafe });
        }
        let new_raw = crate::parse_hex_payload(raw_hex)?;
        let old_raw = uds.read_data_by_identifier(did).map_err(classify_uds)?;

        let backup = backups.create_did_write(
            ecu,
            did,
            None,
            &crate::to_hex_upper(&old_raw),
            &crate::to_hex_upper(&new_raw),
        )?;

        uds.write_data_by_identifier(did, &new_raw).map_err(classify_uds)?;
        let readback_raw = uds.read_data_by_identifier(did).map_err(classify_uds)?;

        log::info!("raw write to ecu={ecu} did={did:04X} (backup {})", backup.backup_id);

        Ok(WriteReport {
            backup_id: backup.backup_id,
            old: ValueSnapshot {
                raw: crate::to_hex_upper(&old_raw),
                value: AdaptValue::Hex(crate::to_hex_upper(&old_raw)),
            },
            new: ValueSnapshot {
                raw: crate::to_hex_upper(&readback_raw),
                value: AdaptValue::Hex(crate::to_hex_upper(&readback_raw)),
            },
            mode,
        })
    }

    /// Restores a `did_write` backup by writing its `old_hex` back to the ECU
    /// and reading it back. Only revertable for `did_write` records; a
    /// `did_snapshot` backup has no "new" value to undo from. Does not consult
    /// the dataset pack at all -- see [`revert_backup`], which this delegates to.
    pub fn revert(
        &self,
        uds: &mut UdsClient,
        backups: &BackupStore,
        backup_id: &str,
    ) -> Result<RevertReport, AdaptationsError> {
        revert_backup(uds, backups, backup_id)
    }
}

/// Restores a `did_write` backup by writing its `old_hex` back to the ECU and
/// reading it back. Free-standing (not a method on [`AdaptationsManager`])
/// because reverting never consults a dataset pack -- the façade can revert a
/// backup without having loaded any brand's settings.
pub fn revert_backup(uds: &mut UdsClient, backups: &BackupStore, backup_id: &str) -> Result<RevertReport, AdaptationsError> {
    let record: BackupRecord = backups.load(backup_id)?;
    if record.kind != crate::backups::BackupKind::DidWrite {
        return Err(AdaptationsError::NotRevertable(backup_id.to_string()));
    }
    let old_hex = record
        .old_hex
        .as_deref()
        .ok_or_else(|| AdaptationsError::NotRevertable(backup_id.to_string()))?;
    let old_raw = crate::parse_hex_payload(old_hex)?;

    uds.write_data_by_identifier(record.did, &old_raw).map_err(classify_uds)?;
    let readback = uds.read_data_by_identifier(record.did).map_err(classify_uds)?;

    log::info!("backup {backup_id} reverted (ecu={}, did={:04X})", record.ecu, record.did);

    Ok(RevertReport {
        backup_id: backup_id.to_string(),
        restored_raw: crate::to_hex_upper(&readback),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can::CanTransport;
    use crate::sim::{ChannelPair, SimEcu};
    use crate::CanIdMode;
    use std::collections::HashMap;

    fn pack_with_one_setting(needs_security: bool) -> DatasetPack {
        let dir = std::env::temp_dir().join(format!(
            "uds_diag_core_adapt_test_{}_{}",
            std::process::id(),
            needs_security
        ));
        let brand_dir = dir.join("acme");
        std::fs::create_dir_all(brand_dir.join("adaptations")).unwrap();
        std::fs::write(
            brand_dir.join("manifest.json"),
            r#"{"brand":"acme","version":"1.0","type":"datasets"}"#,
        )
        .unwrap();
        std::fs::write(
            brand_dir.join("adaptations/01.json"),
            format!(
                r#"{{"ecu":"01","ecu_name":"Engine","settings":[
                    {{"key":"drl","label":"Daytime running lights","kind":"bool",
                     "read":{{"service":"did","id":4660}},"write":{{"service":"did","id":4660}},
                     "risk":"safe","notes":"","needs_security_access":{needs_security}}}
                ]}}"#
            ),
        )
        .unwrap();
        DatasetPack::load(&dir, "acme").unwrap()
    }

    #[test]
    fn mode_gating_matches_risk_matrix() {
        assert!(WriteMode::Safe.allows(Risk::Safe));
        assert!(!WriteMode::Safe.allows(Risk::Risky));
        assert!(WriteMode::Advanced.allows(Risk::Risky));
        assert!(!WriteMode::Advanced.allows(Risk::Unsafe));
        assert!(WriteMode::Unsafe.allows(Risk::Unsafe));
    }

    #[test]
    fn write_round_trips_through_simulated_ecu() {
        let pack = pack_with_one_setting(false);
        let manager = AdaptationsManager::new(pack);
        let backups_dir = std::env::temp_dir().join(format!("uds_diag_core_adapt_backups_{}", std::process::id()));
        let backups = BackupStore::new(&backups_dir).unwrap();

        let (mut tester, ecu_side) = ChannelPair::new();
        let current = std::sync::Arc::new(std::sync::Mutex::new(vec![0x00u8]));
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
            .write(&mut uds, &backups, "01", "drl", "true", WriteMode::Safe, None)
            .unwrap();
        assert_eq!(report.old.value, AdaptValue::Bool(false));
        assert_eq!(report.new.value, AdaptValue::Bool(true));
        assert_eq!(report.backup_id, "000001");

        let backup = backups.load(&report.backup_id).unwrap();
        assert_eq!(backup.old_hex.as_deref(), Some("00"));
        assert_eq!(backup.new_hex.as_deref(), Some("01"));

        drop(uds);
        sim.join();
        std::fs::remove_dir_all(&backups_dir).ok();
    }

    struct NeverCalledTransport;
    impl CanTransport for NeverCalledTransport {
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
    fn write_denied_by_mode_never_touches_the_transport() {
        let pack = pack_with_one_setting(false);
        let mut profile = pack.adaptations_for("01").unwrap().clone();
        profile.settings[0].risk = Risk::Unsafe;
        let dir = std::env::temp_dir().join(format!("uds_diag_core_adapt_denied_{}", std::process::id()));
        std::fs::create_dir_all(dir.join("acme/adaptations")).unwrap();
        std::fs::write(
            dir.join("acme/manifest.json"),
            r#"{"brand":"acme","version":"1.0","type":"datasets"}"#,
        )
        .unwrap();
        std::fs::write(
            dir.join("acme/adaptations/01.json"),
            serde_json::to_string(&profile).unwrap(),
        )
        .unwrap();
        let pack = DatasetPack::load(&dir, "acme").unwrap();
        let manager = AdaptationsManager::new(pack);
        let backups_dir = std::env::temp_dir().join(format!("uds_diag_core_adapt_denied_backups_{}", std::process::id()));
        let backups = BackupStore::new(&backups_dir).unwrap();

        let mut transport = NeverCalledTransport;
        let mut uds = UdsClient::new(&mut transport, "01", CanIdMode::Bit11).unwrap();

        let err = manager
            .write(&mut uds, &backups, "01", "drl", "true", WriteMode::Safe, None)
            .unwrap_err();
        assert!(matches!(err, AdaptationsError::ModeDenied { .. }));

        std::fs::remove_dir_all(&dir).ok();
        std::fs::remove_dir_all(&backups_dir).ok();
    }

    #[test]
    fn encode_enum_value_accepts_label_case_insensitively() {
        let mut map = HashMap::new();
        map.insert("1".to_string(), "Sport".to_string());
        let spec = AdaptSettingSpec {
            key: "mode".to_string(),
            label: "Mode".to_string(),
            kind: AdaptKind::Enum,
            read: crate::datasets::DidTarget { service: "did".to_string(), id: 0x1000 },
            write: crate::datasets::DidTarget { service: "did".to_string(), id: 0x1000 },
            risk: Risk::Risky,
            notes: String::new(),
            needs_security_access: false,
            r#enum: Some(map),
        };
        assert_eq!(encode_enum_value(&spec, "sport").unwrap(), vec![0x01]);
        assert!(encode_enum_value(&spec, "eco").is_err());
    }
}
