//! Generic, brand-agnostic DTC descriptions and ECU naming. Always consulted last.

use super::BrandModule;

/// A small table of well-known SAE-generic (P0xxx) DTC descriptions. Not
/// exhaustive -- this crate does not ship a full J2012 description database -- but
/// enough to exercise the description pipeline end to end.
const GENERIC_DTC_DESCRIPTIONS: &[(&str, &str)] = &[
    ("P0300", "Random/multiple cylinder misfire detected"),
    ("P0301", "Cylinder 1 misfire detected"),
    ("P0171", "System too lean (Bank 1)"),
    ("P0420", "Catalyst system efficiency below threshold (Bank 1)"),
    ("U0100", "Lost communication with ECM/PCM"),
];

/// The brand-agnostic fallback module.
#[derive(Debug, Copy, Clone)]
pub struct Generic;

impl BrandModule for Generic {
    fn describe_dtc(&self, formatted_code: &str) -> Option<&'static str> {
        GENERIC_DTC_DESCRIPTIONS
            .iter()
            .find(|(code, _)| *code == formatted_code)
            .map(|(_, desc)| *desc)
    }

    fn ecu_name(&self, _ecu: &str) -> Option<&'static str> {
        None
    }
}
