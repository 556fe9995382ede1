//! Volkswagen Audi Group ECU naming and DTC description overrides.

use super::BrandModule;

const VAG_ECU_NAMES: &[(&str, &str)] = &[
    ("01", "Engine Control Module"),
    ("03", "ABS Brakes"),
    ("17", "Instrument Cluster"),
];

const VAG_DTC_DESCRIPTIONS: &[(&str, &str)] = &[
    ("P0300", "Misfire detected - multiple cylinders (VAG)"),
];

/// The VAG-specific brand module.
#[derive(Debug, Copy, Clone)]
pub struct Vag;

impl BrandModule for Vag {
    fn describe_dtc(&self, formatted_code: &str) -> Option<&'static str> {
        VAG_DTC_DESCRIPTIONS
            .iter()
            .find(|(code, _)| *code == formatted_code)
            .map(|(_, desc)| *desc)
    }

    fn ecu_name(&self, ecu: &str) -> Option<&'static str> {
        VAG_ECU_NAMES
            .iter()
            .find(|(e, _)| *e == ecu)
            .map(|(_, name)| *name)
    }
}
