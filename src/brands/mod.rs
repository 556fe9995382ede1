//! Brand registry (C8): per-brand ECU naming and DTC description overrides.
//!
//! A tagged enum selects the brand module by name; the composition rule is fixed:
//! try the brand-specific module first, then always fall through to [`generic`].

pub mod generic;
pub mod vag;

/// Capability every brand module provides. A brand only needs to override what it
/// actually knows about; everything else falls through to [`generic`].
pub trait BrandModule {
    /// Returns a human-readable description for a formatted DTC code (e.g. `"P0300"`),
    /// or `None` if this brand has no specific knowledge of it.
    fn describe_dtc(&self, formatted_code: &str) -> Option<&'static str>;

    /// Returns a display name for an ECU address, or `None` if this brand has no
    /// specific knowledge of it.
    fn ecu_name(&self, ecu: &str) -> Option<&'static str>;
}

/// The known brand modules, selected by name (case-insensitive). Unknown or absent
/// brand names resolve to [`generic`] only.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Brand {
    /// Volkswagen Audi Group family of ECU naming/DTC conventions.
    Vag,
}

impl Brand {
    /// Parses a brand name (case-insensitive) into a known [`Brand`], or `None` if
    /// it is not recognized (in which case only the generic module applies).
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "vag" => Some(Self::Vag),
            _ => None,
        }
    }

    fn module(self) -> &'static dyn BrandModule {
        match self {
            Self::Vag => &vag::Vag,
        }
    }
}

/// Describes a DTC code for display, trying the brand-specific module first and
/// falling back to [`generic::Generic`]. Never fails: an unknown code describes as
/// `None`, which callers render as an empty/absent description.
pub fn describe_dtc(brand: Option<&str>, formatted_code: &str) -> Option<&'static str> {
    if let Some(b) = brand.and_then(Brand::parse) {
        if let Some(desc) = b.module().describe_dtc(formatted_code) {
            return Some(desc);
        }
    }
    generic::Generic.describe_dtc(formatted_code)
}

/// Resolves a display name for `ecu`, trying the brand-specific module first and
/// falling back to `"Unknown ECU"`.
pub fn resolve_ecu_name(ecu: &str, brand: Option<&str>) -> String {
    if let Some(b) = brand.and_then(Brand::parse) {
        if let Some(name) = b.module().ecu_name(ecu) {
            return name.to_string();
        }
    }
    generic::Generic
        .ecu_name(ecu)
        .map(str::to_string)
        .unwrap_or_else(|| "Unknown ECU".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_brand_falls_through_to_generic() {
        assert_eq!(resolve_ecu_name("01", Some("totally-unknown")), "Unknown ECU");
        assert_eq!(describe_dtc(Some("totally-unknown"), "P0300"), Some("Random/multiple cylinder misfire detected"));
    }

    #[test]
    fn vag_overrides_win_over_generic() {
        assert_eq!(resolve_ecu_name("01", Some("vag")), "Engine Control Module");
        assert_eq!(resolve_ecu_name("01", Some("vag")), vag::Vag.ecu_name("01").unwrap());
    }

    #[test]
    fn no_brand_uses_generic_only() {
        assert_eq!(resolve_ecu_name("FF", None), "Unknown ECU");
    }
}
