//! Live-watch tick loop (C13): polls an ordered set of `(ecu, did)` items on
//! every call to [`Watcher::tick`], emitting either only the items that changed
//! or all of them, per the watcher's [`EmitMode`].

use serde::{Deserialize, Serialize};

use crate::did::{self, DidValue};
use crate::uds::{UdsClient, UdsError};

/// Whether a [`Watcher`] emits every item on every tick, or only the ones whose
/// decoded value changed since the last tick.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmitMode {
    /// Only items whose value differs from the previous tick are emitted.
    Changed,
    /// Every watched item is emitted on every tick.
    Always,
}

/// One watched `(ecu, did)` pair's reading on a single tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchSample {
    /// ECU the value was read from.
    pub ecu: String,
    /// DID the value was read from.
    pub did: u16,
    /// Resolved display name.
    pub name: String,
    /// Uppercase hex of the raw bytes, if the read succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
    /// Decoded value, if the read succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<DidValue>,
    /// Error message, if the read failed. A failed read never aborts the tick;
    /// it degrades to this field.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One tick's worth of watch output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchTick {
    /// Monotonically increasing tick counter, starting at `1`.
    pub tick: u64,
    /// Samples emitted this tick -- either all watched items ([`EmitMode::Always`])
    /// or only the ones that changed ([`EmitMode::Changed`]).
    pub samples: Vec<WatchSample>,
}

/// Drives a [`UdsClient`] against an ordered list of `(ecu, did)` items and
/// reports per-tick samples under the configured [`EmitMode`]. A
/// watcher's last-seen table is private to that watcher instance: two watchers
/// over the same items never share change-detection state.
#[derive(Debug)]
pub struct Watcher {
    items: Vec<(String, u16)>,
    mode: EmitMode,
    tick: u64,
    last_seen: std::collections::HashMap<(String, u16), DidValue>,
}

impl Watcher {
    /// Builds a watcher over `items` (ECU/DID pairs, in the order they should be
    /// polled and reported), under `mode`. The tick counter starts at `1` on the
    /// first call to [`Watcher::tick`].
    pub fn new(items: Vec<(String, u16)>, mode: EmitMode) -> Self {
        Self {
            items,
            mode,
            tick: 0,
            last_seen: std::collections::HashMap::new(),
        }
    }

    /// Reads every watched item against `uds` (which must already be bound to
    /// the right ECU for each item it reads -- this re-binds per item via
    /// [`UdsClient::set_ecu`]) and reports a [`WatchTick`] per the configured
    /// [`EmitMode`].
    pub fn tick(&mut self, uds: &mut UdsClient) -> WatchTick {
        self.tick += 1;
        let mut samples = Vec::new();

        for (ecu, target_did) in self.items.clone() {
            let sample = self.read_one(uds, &ecu, target_did);
            let key = (ecu.clone(), target_did);
            let changed = match (&sample.value, self.last_seen.get(&key)) {
                (Some(new), Some(old)) => new != old,
                (Some(_), None) => true,
                (None, _) => true,
            };
            if let Some(value) = &sample.value {
                self.last_seen.insert(key, value.clone());
            }
            if self.mode == EmitMode::Always || changed {
                samples.push(sample);
            }
        }

        log::debug!("watch tick {} emitted {} sample(s)", self.tick, samples.len());
        WatchTick {
            tick: self.tick,
            samples,
        }
    }

    fn read_one(&self, uds: &mut UdsClient, ecu: &str, target_did: u16) -> WatchSample {
        if let Err(e) = uds.set_ecu(ecu) {
            return WatchSample {
                ecu: ecu.to_string(),
                did: target_did,
                name: did::lookup(target_did).map(|s| s.name.to_string()).unwrap_or_default(),
                raw: None,
                value: None,
                error: Some(e.to_string()),
            };
        }
        match uds.read_data_by_identifier(target_did) {
            Ok(raw) => {
                let (name, value) = match did::lookup(target_did) {
                    Some(spec) => (spec.name.to_string(), did::decode(spec, &raw)),
                    None => did::decode_unregistered(target_did, &raw),
                };
                WatchSample {
                    ecu: ecu.to_string(),
                    did: target_did,
                    name,
                    raw: Some(crate::to_hex_upper(&raw)),
                    value: Some(value),
                    error: None,
                }
            }
            Err(e) => WatchSample {
                ecu: ecu.to_string(),
                did: target_did,
                name: did::lookup(target_did).map(|s| s.name.to_string()).unwrap_or_default(),
                raw: None,
                value: None,
                error: Some(describe_uds_error(&e)),
            },
        }
    }
}

fn describe_uds_error(e: &UdsError) -> String {
    e.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{ChannelPair, SimEcu};
    use crate::CanIdMode;
    use std::sync::atomic::{AtomicU8, Ordering};
    use std::sync::Arc;

    #[test]
    fn tick_counter_starts_at_one_and_increments() {
        let (mut tester, ecu_side) = ChannelPair::new();
        let sim = SimEcu::spawn(ecu_side, 0x7E1, 0x7E9, |req| {
            if req[0] == 0x22 {
                Some(vec![0x62, 0xF1, 0x90, 0x01])
            } else {
                None
            }
        });
        let mut uds = UdsClient::new(&mut tester, "01", CanIdMode::Bit11).unwrap();
        let mut watcher = Watcher::new(vec![("01".to_string(), 0xF190)], EmitMode::Always);
        let t1 = watcher.tick(&mut uds);
        let t2 = watcher.tick(&mut uds);
        assert_eq!(t1.tick, 1);
        assert_eq!(t2.tick, 2);
        drop(uds);
        sim.join();
    }

    #[test]
    fn changed_mode_suppresses_unchanged_samples() {
        let (mut tester, ecu_side) = ChannelPair::new();
        let counter = Arc::new(AtomicU8::new(0));
        let counter_for_ecu = counter.clone();
        let sim = SimEcu::spawn(ecu_side, 0x7E1, 0x7E9, move |req| {
            if req[0] == 0x22 {
                let tick = counter_for_ecu.fetch_add(1, Ordering::SeqCst);
                // Changes on tick 0 -> 1 (first read), stays flat afterwards.
                let value = if tick == 0 { 0x01 } else { 0x01 };
                Some(vec![0x62, 0xF1, 0x90, value])
            } else {
                None
            }
        });
        let mut uds = UdsClient::new(&mut tester, "01", CanIdMode::Bit11).unwrap();
        let mut watcher = Watcher::new(vec![("01".to_string(), 0xF190)], EmitMode::Changed);
        let t1 = watcher.tick(&mut uds);
        let t2 = watcher.tick(&mut uds);
        assert_eq!(t1.samples.len(), 1, "first tick always emits (no prior baseline)");
        assert_eq!(t2.samples.len(), 0, "unchanged value is suppressed under Changed mode");
        drop(uds);
        sim.join();
    }

    #[test]
    fn always_mode_emits_every_item_every_tick() {
        let (mut tester, ecu_side) = ChannelPair::new();
        let sim = SimEcu::spawn(ecu_side, 0x7E1, 0x7E9, |req| {
            if req[0] == 0x22 {
                Some(vec![0x62, 0xF1, 0x90, 0x01])
            } else {
                None
            }
        });
        let mut uds = UdsClient::new(&mut tester, "01", CanIdMode::Bit11).unwrap();
        let mut watcher = Watcher::new(vec![("01".to_string(), 0xF190)], EmitMode::Always);
        let t1 = watcher.tick(&mut uds);
        let t2 = watcher.tick(&mut uds);
        assert_eq!(t1.samples.len(), 1);
        assert_eq!(t2.samples.len(), 1);
        drop(uds);
        sim.join();
    }

    #[test]
    fn failed_read_degrades_to_an_error_sample_rather_than_aborting() {
        let (mut tester, ecu_side) = ChannelPair::new();
        let sim = SimEcu::spawn(ecu_side, 0x7E1, 0x7E9, |req| {
            if req[0] == 0x22 {
                Some(vec![0x7F, 0x22, 0x31])
            } else {
                None
            }
        });
        let mut uds = UdsClient::new(&mut tester, "01", CanIdMode::Bit11).unwrap();
        let mut watcher = Watcher::new(vec![("01".to_string(), 0xF190)], EmitMode::Always);
        let t1 = watcher.tick(&mut uds);
        assert_eq!(t1.samples.len(), 1);
        assert!(t1.samples[0].error.is_some());
        assert!(t1.samples[0].value.is_none());
        drop(uds);
        sim.join();
    }
}
