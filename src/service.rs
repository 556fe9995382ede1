//! Diagnostic service façade (C14): the single entry point frontends (a CLI, the
//! [`crate::ipc`] server) drive instead of touching the component modules
//! directly. Owns the active ECU, the backup store, and the lazily-loaded
//! adaptations/long-coding managers for one dataset pack.

use std::path::PathBuf;

use crate::adaptations::{AdaptationsError, AdaptationsManager, WriteMode, WriteReport as AdaptWriteReport};
use crate::backups::{BackupError, BackupStore};
use crate::can::CanTransport;
use crate::credential::CredentialError;
use crate::datasets::{DatasetError, DatasetPack};
use crate::did::DidValue;
use crate::discovery::{self, DiscoveryError, ScanConfig};
use crate::dtc::Dtc;
use crate::freeze_frame::FreezeFrame;
use crate::longcoding::{LongCodingError, LongCodingManager, WriteReport as LongCodingWriteReport};
use crate::topology::Topology;
use crate::uds::{SecurityUnlock, UdsClient, UdsError};
use crate::watch::{EmitMode, WatchTick, Watcher};
use crate::{CanIdMode, ValidationError};

/// Explicit construction parameters for a [`DiagnosticService`]: no
/// builder, no `Default` -- every field a caller needs is passed at construction.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Addressing mode the bus is configured for.
    pub can_id_mode: CanIdMode,
    /// Brand name used for DTC/ECU-name resolution and dataset pack selection
    /// (case-insensitive, e.g. `"vag"`); `None` uses only the generic fallbacks
    /// and disables the adaptations/long-coding engines.
    pub brand: Option<String>,
    /// Root directory of validated dataset packs (`datasets_root/<brand>/...`).
    pub datasets_root: PathBuf,
    /// Root directory of the append-only backup store.
    pub backups_root: PathBuf,
    /// Path to the persisted [`crate::credential::CredentialRecord`] that gates
    /// [`WriteMode::Unsafe`] writes. `None` means unsafe-mode writes are
    /// always rejected, regardless of any password the caller supplies.
    pub credential_path: Option<PathBuf>,
}

/// Errors raised by [`DiagnosticService`] operations.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// A caller-supplied identifier failed validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// A UDS request failed.
    #[error(transparent)]
    Uds(#[from] UdsError),
    /// A discovery scan failed.
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    /// The dataset pack for the configured brand could not be loaded.
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    /// The backup store failed.
    #[error(transparent)]
    Backup(#[from] BackupError),
    /// An adaptations engine call failed.
    #[error(transparent)]
    Adaptations(#[from] AdaptationsError),
    /// A long-coding engine call failed.
    #[error(transparent)]
    LongCoding(#[from] LongCodingError),
    /// The service was asked to perform a dataset-backed operation (adaptations,
    /// long-coding) with no brand configured.
    #[error("no brand configured; adaptations and long-coding are unavailable")]
    NoBrandConfigured,
    /// The credential record could not be read or parsed.
    #[error(transparent)]
    Credential(#[from] CredentialError),
    /// An `unsafe`-mode write was attempted but no `credential_path` is configured.
    #[error("unsafe mode requires a configured credential file")]
    NoCredentialConfigured,
    /// An `unsafe`-mode write was attempted without a password.
    #[error("unsafe mode requires a password")]
    MissingPassword,
    /// The supplied password did not match the stored credential record.
    #[error("incorrect password")]
    WrongPassword,
}

/// The single facade every frontend (CLI, [`crate::ipc`] server) drives.
/// Holds the active ECU, the transport, the backup store, and -- once first
/// requested -- the dataset pack's adaptations/long-coding managers.
pub struct DiagnosticService<'a> {
    transport: &'a mut dyn CanTransport,
    config: ServiceConfig,
    active_ecu: String,
    backups: BackupStore,
    adaptations: Option<AdaptationsManager>,
    longcoding: Option<LongCodingManager>,
}

impl<'a> std::fmt::Debug for DiagnosticService<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiagnosticService")
            .field("brand", &self.config.brand)
            .field("active_ecu", &self.active_ecu)
            .finish()
    }
}

impl<'a> DiagnosticService<'a> {
    /// Builds a service bound to `transport`, with `initial_ecu` as the active
    /// ECU. Opens (creating if necessary) the backup store at
    /// `config.backups_root`; does not yet load any dataset pack.
    pub fn new(transport: &'a mut dyn CanTransport, config: ServiceConfig, initial_ecu: &str) -> Result<Self, ServiceError> {
        let active_ecu = crate::normalize_ecu(initial_ecu)?;
        let backups = BackupStore::new(&config.backups_root)?;
        Ok(Self {
            transport,
            config,
            active_ecu,
            backups,
            adaptations: None,
            longcoding: None,
        })
    }

    /// The currently active ECU address (2 uppercase hex digits).
    pub fn active_ecu(&self) -> &str {
        &self.active_ecu
    }

    /// Changes the active ECU every subsequent service call operates against.
    pub fn set_active_ecu(&mut self, ecu: &str) -> Result<(), ServiceError> {
        self.active_ecu = crate::normalize_ecu(ecu)?;
        Ok(())
    }

    fn uds(&mut self) -> Result<UdsClient<'_>, ServiceError> {
        Ok(UdsClient::new(self.transport, &self.active_ecu, self.config.can_id_mode)?)
    }

    fn ensure_adaptations(&mut self) -> Result<&AdaptationsManager, ServiceError> {
        if self.adaptations.is_none() {
            let brand = self.config.brand.as_deref().ok_or(ServiceError::NoBrandConfigured)?;
            let pack = DatasetPack::load(&self.config.datasets_root, brand)?;
            self.adaptations = Some(AdaptationsManager::new(pack));
        }
        Ok(self.adaptations.as_ref().expect("just initialized"))
    }

    /// Verifies `password` against the configured credential record whenever
    /// `mode == WriteMode::Unsafe`; a no-op for `safe`/`advanced`.
    /// The façade performs this check itself -- it never delegates password
    /// verification to the adaptations/long-coding engines -- and does so before
    /// any backup or write is attempted.
    fn verify_unsafe_mode(&self, mode: WriteMode, password: Option<&str>) -> Result<(), ServiceError> {
        if mode != WriteMode::Unsafe {
            return Ok(());
        }
        let path = self
            .config
            .credential_path
            .as_deref()
            .ok_or(ServiceError::NoCredentialConfigured)?;
        let password = password.ok_or(ServiceError::MissingPassword)?;
        let record = crate::credential::load_record(path)?;
        if crate::credential::verify_password(password, &record)? {
            Ok(())
        } else {
            Err(ServiceError::WrongPassword)
        }
    }

    fn ensure_longcoding(&mut self) -> Result<&LongCodingManager, ServiceError> {
        if self.longcoding.is_none() {
            let brand = self.config.brand.as_deref().ok_or(ServiceError::NoBrandConfigured)?;
            let pack = DatasetPack::load(&self.config.datasets_root, brand)?;
            self.longcoding = Some(LongCodingManager::new(pack));
        }
        Ok(self.longcoding.as_ref().expect("just initialized"))
    }

    /// Runs a discovery scan against the bus and returns the resulting [`Topology`].
    /// Does not change the active ECU.
    pub fn scan(&mut self, scan_config: &ScanConfig) -> Result<Topology, ServiceError> {
        Ok(discovery::scan(self.transport, scan_config, self.config.brand.as_deref())?)
    }

    /// Puts the active ECU into `session` via `DiagnosticSessionControl`.
    pub fn start_session(&mut self, session: u8) -> Result<(), ServiceError> {
        self.uds()?.diagnostic_session_control(session)?;
        Ok(())
    }

    /// Reads every DTC matching `status_mask` from the active ECU, fully
    /// classified and brand-described.
    pub fn read_dtcs(&mut self, status_mask: u8) -> Result<Vec<Dtc>, ServiceError> {
        let brand = self.config.brand.clone();
        let raw = self.uds()?.read_dtc_by_status_mask(status_mask)?;
        Ok(raw
            .into_iter()
            .map(|(hi, lo, status)| crate::dtc::decode(hi, lo, status, brand.as_deref()))
            .collect())
    }

    /// Clears every DTC on the active ECU.
    pub fn clear_dtcs(&mut self) -> Result<(), ServiceError> {
        self.uds()?.clear_diagnostic_information()?;
        Ok(())
    }

    /// Reads and decodes a single DID from the active ECU, consulting the
    /// general registry (falling back to raw hex for unknown DIDs).
    pub fn read_did(&mut self, did: u16) -> Result<(String, DidValue), ServiceError> {
        let raw = self.uds()?.read_data_by_identifier(did)?;
        Ok(match crate::did::lookup(did) {
            Some(spec) => (spec.name.to_string(), crate::did::decode(spec, &raw)),
            None => crate::did::decode_unregistered(did, &raw),
        })
    }

    /// Reads and decodes several DIDs from the active ECU, in the order given.
    /// Each DID is read independently via [`Self::read_did`]; a failure on one
    /// DID does not abort the rest (it is still surfaced, so the caller can
    /// distinguish it from a `None`).
    pub fn read_dids(&mut self, dids: &[u16]) -> Vec<(u16, Result<(String, DidValue), ServiceError>)> {
        dids.iter().map(|&did| (did, self.read_did(did))).collect()
    }

    /// Takes a point-in-time snapshot backup of a raw DID on the active ECU,
    /// without consulting any dataset: reads via the UDS client with the
    /// active ECU set and records `raw_hex` in uppercase.
    pub fn backup_did(&mut self, did: u16) -> Result<crate::backups::BackupRecord, ServiceError> {
        let ecu = self.active_ecu.clone();
        let raw = self.uds()?.read_data_by_identifier(did)?;
        Ok(self.backups.create_did_snapshot(&ecu, did, None, &crate::to_hex_upper(&raw))?)
    }

    /// Takes a point-in-time snapshot backup of a dataset-described adaptation
    /// setting, resolving `key` to a DID first (distinct from [`Self::backup_did`],
    /// which takes a raw DID and never touches the dataset).
    pub fn backup_adaptation(&mut self, key: &str) -> Result<crate::backups::BackupRecord, ServiceError> {
        let ecu = self.active_ecu.clone();
        self.ensure_adaptations()?;
        let spec = self
            .adaptations
            .as_ref()
            .expect("initialized above")
            .list(&ecu)?
            .iter()
            .find(|s| s.key == key)
            .ok_or_else(|| crate::adaptations::AdaptationsError::UnknownSetting(key.to_string()))?
            .clone();
        let raw = self.uds()?.read_data_by_identifier(spec.read.id)?;
        Ok(self
            .backups
            .create_did_snapshot(&ecu, spec.read.id, Some(key), &crate::to_hex_upper(&raw))?)
    }

    /// Reads every freeze-frame snapshot captured for `dtc_code16`, best-effort
    /// (never fails the call outright; see [`crate::freeze_frame::read_snapshots_for_dtc`]).
    pub fn read_freeze_frames(&mut self, dtc_code16: u16, status_mask: u8) -> Result<Vec<FreezeFrame>, ServiceError> {
        Ok(crate::freeze_frame::read_snapshots_for_dtc(&mut self.uds()?, dtc_code16, status_mask))
    }

    /// Performs a `SecurityAccess` seed/key exchange against the active ECU.
    pub fn security_unlock(&mut self, level: u8, unlock: &SecurityUnlock<'_>) -> Result<(), ServiceError> {
        let ecu = self.active_ecu.clone();
        crate::uds::security_unlock(&mut self.uds()?, level, unlock, &ecu)?;
        Ok(())
    }

    /// Lists the adaptation settings the dataset pack declares for the active
    /// ECU, loading the pack on first use.
    pub fn list_adaptations(&mut self) -> Result<Vec<crate::datasets::AdaptSettingSpec>, ServiceError> {
        let ecu = self.active_ecu.clone();
        Ok(self.ensure_adaptations()?.list(&ecu)?.to_vec())
    }

    /// Reads a single adaptation setting's current value.
    pub fn read_adaptation(&mut self, key: &str) -> Result<crate::adaptations::ValueSnapshot, ServiceError> {
        let ecu = self.active_ecu.clone();
        self.ensure_adaptations()?;
        let mut uds = UdsClient::new(self.transport, &ecu, self.config.can_id_mode)?;
        Ok(self.adaptations.as_ref().expect("initialized above").read(&mut uds, &ecu, key)?)
    }

    /// Writes an adaptation setting, per the validate/backup/write/readback
    /// cycle. `password` is consulted (and must match the configured credential
    /// record) only when `mode == WriteMode::Unsafe`; it is checked before the
    /// dataset is even resolved.
    pub fn write_adaptation(
        &mut self,
        key: &str,
        value: &str,
        mode: WriteMode,
        security: Option<(u8, &SecurityUnlock<'_>)>,
        password: Option<&str>,
    ) -> Result<AdaptWriteReport, ServiceError> {
        self.verify_unsafe_mode(mode, password)?;
        let ecu = self.active_ecu.clone();
        self.ensure_adaptations()?;
        let mut uds = UdsClient::new(self.transport, &ecu, self.config.can_id_mode)?;
        Ok(self
            .adaptations
            .as_ref()
            .expect("initialized above")
            .write(&mut uds, &self.backups, &ecu, key, value, mode, security)?)
    }

    /// Writes a raw hex payload to `did` on the active ECU, bypassing the
    /// dataset. Requires [`WriteMode::Unsafe`] and (per [`Self::verify_unsafe_mode`])
    /// a matching `password`.
    pub fn write_raw(
        &mut self,
        did: u16,
        raw_hex: &str,
        mode: WriteMode,
        password: Option<&str>,
    ) -> Result<AdaptWriteReport, ServiceError> {
        self.verify_unsafe_mode(mode, password)?;
        let ecu = self.active_ecu.clone();
        self.ensure_adaptations()?;
        let mut uds = UdsClient::new(self.transport, &ecu, self.config.can_id_mode)?;
        Ok(self
            .adaptations
            .as_ref()
            .expect("initialized above")
            .write_raw(&mut uds, &self.backups, &ecu, did, raw_hex, mode)?)
    }

    /// Reverts a `did_write` backup, regardless of which engine (or plain
    /// `backup_did`) created it. Binds the UDS client to the backup record's own
    /// `ecu` field rather than the service's currently-active ECU, so a revert
    /// is correct even if the active ECU has since changed -- this never
    /// requires a dataset pack to be loaded.
    pub fn revert(&mut self, backup_id: &str) -> Result<crate::adaptations::RevertReport, ServiceError> {
        let record = self.backups.load(backup_id)?;
        let mut uds = UdsClient::new(self.transport, &record.ecu, self.config.can_id_mode)?;
        Ok(crate::adaptations::revert_backup(&mut uds, &self.backups, backup_id)?)
    }

    /// Lists the long-coding bit fields the dataset pack declares for the
    /// active ECU.
    pub fn list_longcoding(&mut self) -> Result<Vec<crate::datasets::LongCodingFieldSpec>, ServiceError> {
        let ecu = self.active_ecu.clone();
        Ok(self.ensure_longcoding()?.list(&ecu)?.to_vec())
    }

    /// Reads and decodes every long-coding field for the active ECU.
    pub fn read_longcoding(&mut self) -> Result<Vec<(String, crate::longcoding::CodingValue)>, ServiceError> {
        let ecu = self.active_ecu.clone();
        self.ensure_longcoding()?;
        let mut uds = UdsClient::new(self.transport, &ecu, self.config.can_id_mode)?;
        Ok(self.longcoding.as_ref().expect("initialized above").read_all(&mut uds, &ecu)?)
    }

    /// Writes a single long-coding bit field, per the read/set-bits/write/
    /// readback cycle. `safe` mode never permits a long-coding write; `unsafe`
    /// mode additionally requires a matching `password`.
    pub fn write_longcoding(
        &mut self,
        key: &str,
        value: &str,
        mode: WriteMode,
        security: Option<(u8, &SecurityUnlock<'_>)>,
        password: Option<&str>,
    ) -> Result<LongCodingWriteReport, ServiceError> {
        self.verify_unsafe_mode(mode, password)?;
        let ecu = self.active_ecu.clone();
        self.ensure_longcoding()?;
        let mut uds = UdsClient::new(self.transport, &ecu, self.config.can_id_mode)?;
        Ok(self
            .longcoding
            .as_ref()
            .expect("initialized above")
            .write(&mut uds, &self.backups, &ecu, key, value, mode, security)?)
    }

    /// Builds a [`Watcher`] over `items` and ticks it once against the active
    /// transport, without changing the service's own active ECU afterwards.
    pub fn tick_watch(&mut self, watcher: &mut Watcher) -> Result<WatchTick, ServiceError> {
        let mut uds = UdsClient::new(self.transport, &self.active_ecu, self.config.can_id_mode)?;
        let tick = watcher.tick(&mut uds);
        uds.set_ecu(&self.active_ecu)?;
        Ok(tick)
    }

    /// Builds a new [`Watcher`] over `items` under `mode`. Convenience
    /// wrapper so callers need not import [`crate::watch`] directly.
    pub fn new_watcher(&self, items: Vec<(String, u16)>, mode: EmitMode) -> Watcher {
        Watcher::new(items, mode)
    }

    /// Access to the backup store, for callers that want to list/inspect
    /// records directly rather than through a write call's report.
    pub fn backups(&self) -> &BackupStore {
        &self.backups
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{ChannelPair, SimEcu};

    fn temp_config() -> ServiceConfig {
        let id = std::process::id();
        ServiceConfig {
            can_id_mode: CanIdMode::Bit11,
            brand: None,
            datasets_root: std::env::temp_dir().join(format!("uds_diag_core_svc_datasets_{id}")),
            backups_root: std::env::temp_dir().join(format!("uds_diag_core_svc_backups_{id}")),
            credential_path: None,
        }
    }

    #[test]
    fn read_dtcs_decodes_through_the_facade() {
        let (mut tester, ecu_side) = ChannelPair::new();
        let sim = SimEcu::spawn(ecu_side, 0x7E1, 0x7E9, |req| {
            if req == [0x19, 0x02, 0xFF] {
                Some(vec![0x59, 0x02, 0xFF, 0x03, 0x00, 0x01])
            } else {
                None
            }
        });
        let config = temp_config();
        let mut service = DiagnosticService::new(&mut tester, config.clone(), "01").unwrap();
        let dtcs = service.read_dtcs(0xFF).unwrap();
        assert_eq!(dtcs.len(), 1);
        assert_eq!(dtcs[0].code, "P0300");
        assert_eq!(dtcs[0].status, "active");
        drop(service);
        sim.join();
        std::fs::remove_dir_all(&config.backups_root).ok();
    }

    #[test]
    fn set_active_ecu_normalizes_and_is_used_by_subsequent_calls() {
        let (mut tester, ecu_side) = ChannelPair::new();
        let sim = SimEcu::spawn(ecu_side, 0x7E2, 0x7EA, |req| {
            if req[0] == 0x22 {
                Some(vec![0x62, 0xF1, 0x90, b'X'])
            } else {
                None
            }
        });
        let config = temp_config();
        let mut service = DiagnosticService::new(&mut tester, config.clone(), "01").unwrap();
        service.set_active_ecu("0x2").unwrap();
        assert_eq!(service.active_ecu(), "02");
        let (name, value) = service.read_did(0xF190).unwrap();
        assert_eq!(name, "VIN");
        assert_eq!(value, DidValue::Text("X".to_string()));
        drop(service);
        sim.join();
        std::fs::remove_dir_all(&config.backups_root).ok();
    }

    #[test]
    fn backup_did_snapshots_the_active_ecu_without_a_dataset() {
        let (mut tester, ecu_side) = ChannelPair::new();
        let sim = SimEcu::spawn(ecu_side, 0x7E1, 0x7E9, |req| {
            if req == [0x22, 0xF1, 0x90] {
                Some(vec![0x62, 0xF1, 0x90, 0xAB, 0xCD])
            } else {
                None
            }
        });
        let config = temp_config();
        let mut service = DiagnosticService::new(&mut tester, config.clone(), "01").unwrap();
        let record = service.backup_did(0xF190).unwrap();
        assert_eq!(record.backup_id, "000001");
        assert_eq!(record.raw_hex.as_deref(), Some("ABCD"));
        assert_eq!(record.key, None);
        drop(service);
        sim.join();
        std::fs::remove_dir_all(&config.backups_root).ok();
    }

    #[test]
    fn read_dids_reads_each_did_independently() {
        let (mut tester, ecu_side) = ChannelPair::new();
        let sim = SimEcu::spawn(ecu_side, 0x7E1, 0x7E9, |req| match req {
            [0x22, 0xF1, 0x90] => Some(vec![0x62, 0xF1, 0x90, b'X']),
            [0x22, 0x12, 0x34] => Some(vec![0x62, 0x12, 0x34, 0x00, 0x01]),
            _ => None,
        });
        let config = temp_config();
        let mut service = DiagnosticService::new(&mut tester, config.clone(), "01").unwrap();
        let results = service.read_dids(&[0xF190, 0x1234]);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].1.as_ref().unwrap().1, DidValue::Text("X".to_string()));
        assert_eq!(results[1].1.as_ref().unwrap().1, DidValue::Integer(1));
        drop(service);
        sim.join();
        std::fs::remove_dir_all(&config.backups_root).ok();
    }

    #[test]
    fn revert_targets_the_backup_records_own_ecu_not_the_active_one() {
        let (mut tester, ecu_side) = ChannelPair::new();
        let sim = SimEcu::spawn(ecu_side, 0x7E1, 0x7E9, |req| {
            if req == [0x2E, 0xF1, 0x90, 0x00] {
                Some(vec![0x6E, 0xF1, 0x90])
            } else if req == [0x22, 0xF1, 0x90] {
                Some(vec![0x62, 0xF1, 0x90, 0x00])
            } else {
                None
            }
        });
        let config = temp_config();
        let mut service = DiagnosticService::new(&mut tester, config.clone(), "01").unwrap();
        let backup = service.backups().create_did_write("01", 0xF190, None, "00", "01").unwrap();
        service.set_active_ecu("02").unwrap();
        let report = service.revert(&backup.backup_id).unwrap();
        assert_eq!(report.backup_id, backup.backup_id);
        assert_eq!(report.restored_raw, "00");
        drop(service);
        sim.join();
        std::fs::remove_dir_all(&config.backups_root).ok();
    }

    #[test]
    fn adaptations_without_a_brand_are_unavailable() {
        let (mut tester, _ecu_side) = ChannelPair::new();
        let config = temp_config();
        let mut service = DiagnosticService::new(&mut tester, config.clone(), "01").unwrap();
        let err = service.list_adaptations().unwrap_err();
        assert!(matches!(err, ServiceError::NoBrandConfigured));
        std::fs::remove_dir_all(&config.backups_root).ok();
    }

    #[test]
    fn safe_and_advanced_modes_never_consult_the_credential_gate() {
        let (mut tester, _ecu_side) = ChannelPair::new();
        let config = temp_config();
        let service = DiagnosticService::new(&mut tester, config.clone(), "01").unwrap();
        assert!(service.verify_unsafe_mode(WriteMode::Safe, None).is_ok());
        assert!(service.verify_unsafe_mode(WriteMode::Advanced, None).is_ok());
        std::fs::remove_dir_all(&config.backups_root).ok();
    }

    #[test]
    fn unsafe_mode_without_a_configured_credential_path_is_rejected() {
        let (mut tester, _ecu_side) = ChannelPair::new();
        let config = temp_config();
        let service = DiagnosticService::new(&mut tester, config.clone(), "01").unwrap();
        let err = service.verify_unsafe_mode(WriteMode::Unsafe, Some("hunter2")).unwrap_err();
        assert!(matches!(err, ServiceError::NoCredentialConfigured));
        std::fs::remove_dir_all(&config.backups_root).ok();
    }

    #[test]
    fn unsafe_mode_without_a_password_is_rejected() {
        let (mut tester, _ecu_side) = ChannelPair::new();
        let id = std::process::id();
        let credential_path = std::env::temp_dir().join(format!("uds_diag_core_svc_cred_{id}.json"));
        crate::credential::save_record(&credential_path, &crate::credential::hash_password("hunter2").unwrap())
            .unwrap();
        let mut config = temp_config();
        config.credential_path = Some(credential_path.clone());
        let service = DiagnosticService::new(&mut tester, config.clone(), "01").unwrap();
        let err = service.verify_unsafe_mode(WriteMode::Unsafe, None).unwrap_err();
        assert!(matches!(err, ServiceError::MissingPassword));
        std::fs::remove_dir_all(&config.backups_root).ok();
        std::fs::remove_file(&credential_path).ok();
    }

    #[test]
    fn unsafe_mode_accepts_the_correct_password_and_rejects_a_wrong_one() {
        let (mut tester, _ecu_side) = ChannelPair::new();
        let id = std::process::id();
        let credential_path = std::env::temp_dir().join(format!("uds_diag_core_svc_cred_ok_{id}.json"));
        crate::credential::save_record(&credential_path, &crate::credential::hash_password("hunter2").unwrap())
            .unwrap();
        let mut config = temp_config();
        config.credential_path = Some(credential_path.clone());
        let service = DiagnosticService::new(&mut tester, config.clone(), "01").unwrap();
        assert!(service.verify_unsafe_mode(WriteMode::Unsafe, Some("hunter2")).is_ok());
        let err = service.verify_unsafe_mode(WriteMode::Unsafe, Some("wrong")).unwrap_err();
        assert!(matches!(err, ServiceError::WrongPassword));
        std::fs::remove_dir_all(&config.backups_root).ok();
        std::fs::remove_file(&credential_path).ok();
    }
}
