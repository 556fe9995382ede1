//! DID codec and registry (C5): a fixed table of known data identifiers plus typed
//! decode for whatever bytes `ReadDataByIdentifier` returns.

/// How a DID's raw bytes should be interpreted.
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DidKind {
    /// NUL-padded ASCII text; trailing NULs are stripped.
    Ascii,
    /// Big-endian 16-bit unsigned integer, optionally scaled.
    U16be,
    /// Big-endian 32-bit unsigned integer, optionally scaled.
    U32be,
    /// Opaque bytes, rendered as uppercase hex.
    Bytes,
}

/// A known DID's decode recipe. The registry ([`registry`], [`freeze_frame_registry`])
/// is a fixed table of these; it is never mutated at runtime.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DidSpec {
    /// The 16-bit identifier.
    pub did: u16,
    /// Human-readable name, e.g. `"VIN"`.
    pub name: &'static str,
    /// How to decode the raw bytes.
    pub kind: DidKind,
    /// Multiplier applied to integer kinds. `1.0` renders as an integer; anything
    /// else renders as a float.
    pub scale: f64,
    /// Unit string, empty if dimensionless.
    pub unit: &'static str,
}

/// A decoded DID value, rendered the way every `item`/parameter payload in this
/// crate's JSON output expects it.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum DidValue {
    /// Decoded ASCII text.
    Text(String),
    /// A scaled integer quantity (`scale == 1.0`).
    Integer(i64),
    /// A scaled floating-point quantity (`scale != 1.0`).
    Float(f64),
    /// Uppercase hex, used for `bytes` kind and for any undersized/oversized payload.
    Hex(String),
}

/// The general-purpose DID registry. Immutable; consulted by every plain DID read.
pub fn registry() -> &'static [DidSpec] {
    const REGISTRY: &[DidSpec] = &[
        DidSpec {
            did: 0xF190,
            name: "VIN",
            kind: DidKind::Ascii,
            scale: 1.0,
            unit: "",
        },
        DidSpec {
            did: 0xF187,
            name: "Part Number",
            kind: DidKind::Ascii,
            scale: 1.0,
            unit: "",
        },
        DidSpec {
            did: 0x1234,
            name: "Engine RPM",
            kind: DidKind::U16be,
            scale: 1.0,
            unit: "rpm",
        },
    ];
    REGISTRY
}

/// The freeze-frame-specific DID table: consulted before [`registry`] when
/// decoding a snapshot record parameter.
pub fn freeze_frame_registry() -> &'static [DidSpec] {
    const REGISTRY: &[DidSpec] = &[
        DidSpec {
            did: 0x1235,
            name: "Vehicle Speed",
            kind: DidKind::U16be,
            scale: 1.0,
            unit: "km/h",
        },
        DidSpec {
            did: 0x1236,
            name: "Coolant Temperature",
            kind: DidKind::U16be,
            scale: 1.0,
            unit: "C",
        },
    ];
    REGISTRY
}

/// Looks up `did` in the freeze-frame table first, then the general registry.
pub fn lookup_for_freeze_frame(did: u16) -> Option<&'static DidSpec> {
    freeze_frame_registry()
        .iter()
        .chain(registry().iter())
        .find(|spec| spec.did == did)
}

/// Looks up `did` in the general registry only.
pub fn lookup(did: u16) -> Option<&'static DidSpec> {
    registry().iter().find(|spec| spec.did == did)
}

/// Resolves a display name for `did`, falling back to `"DID <HHHH>"` when unknown.
pub fn display_name(did: u16) -> String {
    lookup(did)
        .map(|spec| spec.name.to_string())
        .unwrap_or_else(|| format!("DID {:04X}", did))
}

/// Decodes `raw` according to `spec`'s kind and scale.
pub fn decode(spec: &DidSpec, raw: &[u8]) -> DidValue {
    match spec.kind {
        DidKind::Ascii => {
            let trimmed = trim_trailing_nul(raw);
            DidValue::Text(String::from_utf8_lossy(trimmed).into_owned())
        }
        DidKind::U16be => decode_scaled_int(raw, 2, spec.scale),
        DidKind::U32be => decode_scaled_int(raw, 4, spec.scale),
        DidKind::Bytes => DidValue::Hex(crate::to_hex_upper(raw)),
    }
}

/// Decodes `raw` bytes for an unregistered DID as `bytes` kind, synthesizing a
/// `"DID <HHHH>"` name.
pub fn decode_unregistered(did: u16, raw: &[u8]) -> (String, DidValue) {
    (display_name(did), DidValue::Hex(crate::to_hex_upper(raw)))
}

fn trim_trailing_nul(raw: &[u8]) -> &[u8] {
    let end = raw.iter().rposition(|&b| b != 0).map(|i| i + 1).unwrap_or(0);
    &raw[..end]
}

fn decode_scaled_int(raw: &[u8], width: usize, scale: f64) -> DidValue {
    if raw.len() != width {
        return DidValue::Hex(crate::to_hex_upper(raw));
    }
    let value: u64 = raw.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64);
    if scale == 1.0 {
        DidValue::Integer(value as i64)
    } else {
        DidValue::Float(value as f64 * scale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_vin_ascii_strips_trailing_nul() {
        let spec = lookup(0xF190).unwrap();
        let raw = b"ABC123\0\0";
        assert_eq!(decode(spec, raw), DidValue::Text("ABC123".to_string()));
    }

    #[test]
    fn decode_ascii_preserves_internal_nul_free_spacing() {
        let spec = lookup(0xF190).unwrap();
        let raw = b"AB 12\0";
        assert_eq!(decode(spec, raw), DidValue::Text("AB 12".to_string()));
    }

    #[test]
    fn decode_u16be_integer_when_unscaled() {
        let spec = lookup(0x1234).unwrap();
        assert_eq!(decode(spec, &[0x03, 0x52]), DidValue::Integer(850));
    }

    #[test]
    fn decode_u16be_float_when_scaled() {
        let spec = DidSpec {
            did: 0x0001,
            name: "Test",
            kind: DidKind::U16be,
            scale: 0.1,
            unit: "",
        };
        assert_eq!(decode(&spec, &[0x00, 0x64]), DidValue::Float(10.0));
    }

    #[test]
    fn decode_bytes_kind_as_uppercase_hex() {
        let spec = DidSpec {
            did: 0x0002,
            name: "Test",
            kind: DidKind::Bytes,
            scale: 1.0,
            unit: "",
        };
        assert_eq!(decode(&spec, &[0xAB, 0xCD]), DidValue::Hex("ABCD".to_string()));
    }

    #[test]
    fn unregistered_did_synthesizes_name() {
        let (name, value) = decode_unregistered(0x9999, &[0x01]);
        assert_eq!(name, "DID 9999");
        assert_eq!(value, DidValue::Hex("01".to_string()));
    }

    #[test]
    fn freeze_frame_registry_consulted_before_general() {
        assert!(lookup_for_freeze_frame(0x1235).is_some());
        assert!(lookup(0x1235).is_none());
    }
}
