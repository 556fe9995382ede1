//! Dataset loader (C9): validated JSON packs describing per-brand adaptations and
//! long-coding fields.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Risk classification gating which write mode may touch a setting/field.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Risk {
    /// Safe to write in `safe` mode.
    Safe,
    /// Requires `advanced` or `unsafe` mode.
    Risky,
    /// Requires `unsafe` mode (and a verified password).
    Unsafe,
}

/// Typed value kind for an adaptation setting.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdaptKind {
    /// Boolean on/off.
    Bool,
    /// Unsigned 8-bit.
    U8,
    /// Unsigned 16-bit, big-endian.
    U16,
    /// Signed 16-bit, big-endian.
    I16,
    /// A labelled set of integer values.
    Enum,
    /// Arbitrary hex payload.
    Bytes,
}

/// Typed value kind for a long-coding bit field.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodingKind {
    /// Boolean on/off, packed into a single bit.
    Bool,
    /// Unsigned integer packed into `len` bits.
    U8,
    /// A labelled set of integer values packed into `len` bits.
    Enum,
}

/// `{service:"did", id:u16}` read/write target for an adaptation setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DidTarget {
    /// Always `"did"` in this version of the dataset format.
    pub service: String,
    /// The target DID.
    pub id: u16,
}

/// One adaptation setting, as loaded from `adaptations/<ecu>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdaptSettingSpec {
    /// Stable key used in API calls (`read_adaptation`, `write_adaptation`, …).
    pub key: String,
    /// Human-readable label.
    pub label: String,
    /// Value kind.
    pub kind: AdaptKind,
    /// Where to read the current value from.
    pub read: DidTarget,
    /// Where to write the new value to.
    pub write: DidTarget,
    /// Risk classification.
    pub risk: Risk,
    /// Free-text notes.
    #[serde(default)]
    pub notes: String,
    /// Whether a security-access unlock is required before writing.
    pub needs_security_access: bool,
    /// For `kind == Enum`: decimal-string-keyed label map.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#enum: Option<HashMap<String, String>>,
}

/// One long-coding bit field, as loaded from `longcoding/<ecu>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LongCodingFieldSpec {
    /// Stable key used in API calls.
    pub key: String,
    /// Human-readable label.
    pub label: String,
    /// Value kind.
    pub kind: CodingKind,
    /// Risk classification.
    pub risk: Risk,
    /// Byte offset within the coding DID's payload.
    pub byte: u8,
    /// Starting bit (`0..=7`) within `byte`.
    pub bit: u8,
    /// Field width in bits (`1..=8`); `bit + len <= 8` (no byte-crossing in v1).
    pub len: u8,
    /// Optional override DID, if this field lives behind a different DID than the
    /// profile default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub did: Option<u16>,
    /// Optional override coding length, if different from the profile default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coding_length: Option<u16>,
    /// For `kind == Enum`: decimal-string-keyed label map.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#enum: Option<HashMap<String, String>>,
    /// Whether a security-access unlock is required before writing.
    pub needs_security_access: bool,
}

/// One `adaptations/<ecu>.json` file's content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdaptationsProfile {
    /// 2-hex-digit uppercase ECU address.
    pub ecu: String,
    /// Display name for this ECU.
    pub ecu_name: String,
    /// The settings this profile exposes.
    pub settings: Vec<AdaptSettingSpec>,
}

/// One `longcoding/<ecu>.json` file's content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LongCodingProfile {
    /// 2-hex-digit uppercase ECU address.
    pub ecu: String,
    /// Display name for this ECU.
    pub ecu_name: String,
    /// 4-hex-digit uppercase DID behind which the coding record lives.
    pub did: String,
    /// Expected byte length of the coding record.
    pub length: u16,
    /// The bit fields this profile exposes.
    pub fields: Vec<LongCodingFieldSpec>,
}

/// `manifest.json` at the root of a brand's dataset pack.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    /// Brand name.
    pub brand: String,
    /// Pack version string.
    pub version: String,
    /// Always `"datasets"`.
    pub r#type: String,
    /// Optional free-text notes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Errors raised while loading or validating a dataset pack.
#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    /// The brand directory does not exist under `datasets_root`.
    #[error("dataset pack not found for brand {0:?}")]
    MissingPack(String),
    /// A required file (manifest, an ecu profile) is missing.
    #[error("missing dataset file: {0}")]
    MissingFile(PathBuf),
    /// The file could not be read from disk.
    #[error("failed to read {path:?}: {source}")]
    Io {
        /// Path that failed to read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The file was not valid JSON.
    #[error("invalid JSON in {path:?}: {source}")]
    InvalidJson {
        /// Path that failed to parse.
        path: PathBuf,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
    /// The parsed content failed strict validation.
    #[error("validation failed for {path:?}: {reason}")]
    Validation {
        /// Path that failed validation.
        path: PathBuf,
        /// Human-readable reason.
        reason: String,
    },
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, DatasetError> {
    let text = std::fs::read_to_string(path).map_err(|source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| DatasetError::InvalidJson {
        path: path.to_path_buf(),
        source,
    })
}

fn is_hex_upper(s: &str, len: usize) -> bool {
    s.len() == len && s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase())
}

fn validate_description(path: &Path, label: &str) -> Result<(), DatasetError> {
    if label.ends_with(['.', '!', '?', ':', ';']) {
        return Err(DatasetError::Validation {
            path: path.to_path_buf(),
            reason: format!("label/description must not end with punctuation: {label:?}"),
        });
    }
    Ok(())
}

fn validate_ecu_field(path: &Path, ecu: &str) -> Result<(), DatasetError> {
    if !is_hex_upper(ecu, 2) {
        return Err(DatasetError::Validation {
            path: path.to_path_buf(),
            reason: format!("ecu must be 2 uppercase hex digits, got {ecu:?}"),
        });
    }
    Ok(())
}

fn validate_did_field(path: &Path, did: &str) -> Result<(), DatasetError> {
    if !is_hex_upper(did, 4) {
        return Err(DatasetError::Validation {
            path: path.to_path_buf(),
            reason: format!("did must be 4 uppercase hex digits, got {did:?}"),
        });
    }
    Ok(())
}

fn validate_adaptations_profile(path: &Path, profile: &AdaptationsProfile) -> Result<(), DatasetError> {
    validate_ecu_field(path, &profile.ecu)?;
    validate_description(path, &profile.ecu_name)?;
    for setting in &profile.settings {
        validate_description(path, &setting.label)?;
        if setting.read.service != "did" || setting.write.service != "did" {
            return Err(DatasetError::Validation {
                path: path.to_path_buf(),
                reason: format!("unsupported service for setting {:?}", setting.key),
            });
        }
        if setting.kind == AdaptKind::Enum && setting.r#enum.is_none() {
            return Err(DatasetError::Validation {
                path: path.to_path_buf(),
                reason: format!("enum setting {:?} missing enum map", setting.key),
            });
        }
    }
    Ok(())
}

fn validate_longcoding_profile(path: &Path, profile: &LongCodingProfile) -> Result<(), DatasetError> {
    validate_ecu_field(path, &profile.ecu)?;
    validate_description(path, &profile.ecu_name)?;
    validate_did_field(path, &profile.did)?;
    for field in &profile.fields {
        validate_description(path, &field.label)?;
        if field.byte as u16 >= profile.length {
            return Err(DatasetError::Validation {
                path: path.to_path_buf(),
                reason: format!(
                    "field {:?} byte {} is out of range for a {}-byte record",
                    field.key, field.byte, profile.length
                ),
            });
        }
        if field.bit as u16 + field.len as u16 > 8 {
            return Err(DatasetError::Validation {
                path: path.to_path_buf(),
                reason: format!(
                    "field {:?} crosses a byte boundary: bit={} len={}",
                    field.key, field.bit, field.len
                ),
            });
        }
        if field.len == 0 {
            return Err(DatasetError::Validation {
                path: path.to_path_buf(),
                reason: format!("field {:?} has zero length", field.key),
            });
        }
        if field.kind == CodingKind::Enum && field.r#enum.is_none() {
            return Err(DatasetError::Validation {
                path: path.to_path_buf(),
                reason: format!("enum field {:?} missing enum map", field.key),
            });
        }
    }
    Ok(())
}

/// An immutable, loaded dataset pack for one brand: every `adaptations/<ecu>.json`
/// and `longcoding/<ecu>.json` profile, indexed by ECU.
#[derive(Debug, Clone)]
pub struct DatasetPack {
    /// The loaded manifest.
    pub manifest: Manifest,
    adaptations: HashMap<String, AdaptationsProfile>,
    longcoding: HashMap<String, LongCodingProfile>,
}

impl DatasetPack {
    /// Loads and strictly validates every profile under `datasets_root/<brand>/`.
    /// A brand directory with neither an `adaptations/` nor a `longcoding/`
    /// subdirectory is not an error; it simply yields an empty pack for each.
    pub fn load(datasets_root: &Path, brand: &str) -> Result<Self, DatasetError> {
        let brand_dir = datasets_root.join(brand);
        if !brand_dir.is_dir() {
            return Err(DatasetError::MissingPack(brand.to_string()));
        }

        let manifest_path = brand_dir.join("manifest.json");
        if !manifest_path.is_file() {
            return Err(DatasetError::MissingFile(manifest_path));
        }
        let manifest: Manifest = read_json(&manifest_path)?;

        let mut adaptations = HashMap::new();
        let adaptations_dir = brand_dir.join("adaptations");
        if adaptations_dir.is_dir() {
            for entry in read_dir_sorted(&adaptations_dir)? {
                if entry.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let profile: AdaptationsProfile = read_json(&entry)?;
                validate_adaptations_profile(&entry, &profile)?;
                adaptations.insert(profile.ecu.clone(), profile);
            }
        }

        let mut longcoding = HashMap::new();
        let longcoding_dir = brand_dir.join("longcoding");
        if longcoding_dir.is_dir() {
            for entry in read_dir_sorted(&longcoding_dir)? {
                if entry.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let profile: LongCodingProfile = read_json(&entry)?;
                validate_longcoding_profile(&entry, &profile)?;
                longcoding.insert(profile.ecu.clone(), profile);
            }
        }

        log::info!(
            "loaded dataset pack {brand:?} version={}: {} adaptation profile(s), {} long-coding profile(s)",
            manifest.version,
            adaptations.len(),
            longcoding.len()
        );

        Ok(Self {
            manifest,
            adaptations,
            longcoding,
        })
    }

    /// Returns the adaptations profile for `ecu`, if the pack has one.
    pub fn adaptations_for(&self, ecu: &str) -> Option<&AdaptationsProfile> {
        self.adaptations.get(ecu)
    }

    /// Returns the long-coding profile for `ecu`, if the pack has one.
    pub fn longcoding_for(&self, ecu: &str) -> Option<&LongCodingProfile> {
        self.longcoding.get(ecu)
    }
}

fn read_dir_sorted(dir: &Path) -> Result<Vec<PathBuf>, DatasetError> {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|source| DatasetError::Io {
            path: dir.to_path_buf(),
            source,
        })?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    entries.sort();
    Ok(entries)
}
