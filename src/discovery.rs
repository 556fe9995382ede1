//! ECU discovery / bus scanning (C7): functional and physical scans that build a
//! fresh [`Topology`].

use crate::can::CanTransport;
use crate::isotp::{IsoTpError, IsoTpTransport};
use crate::topology::{ids_for_ecu, infer_ecu_from_response_id, EcuNode, Topology};
use crate::{CanIdMode, ValidationError, FUNCTIONAL_ID_11BIT, FUNCTIONAL_ID_29BIT};

/// Maximum number of stray frames drained from the bus before a functional scan
/// starts listening, so a noisy bus cannot stall discovery indefinitely.
const MAX_DRAIN_FRAMES: u32 = 64;

const DIAGNOSTIC_SESSION_CONTROL_REQUEST: [u8; 2] = [0x10, 0x01];
const DEFAULT_SESSION: u8 = 0x01;

/// Which ECUs to address during discovery.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Addressing {
    /// Broadcast to the functional id only.
    Functional,
    /// Probe each candidate ECU individually.
    Physical,
    /// Both: functional first, then physical (including any ECUs the functional
    /// scan already found).
    Both,
}

impl Addressing {
    /// Parses the wire string representation used in IPC/dataset configuration.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "functional" => Some(Self::Functional),
            "physical" => Some(Self::Physical),
            "both" => Some(Self::Both),
            _ => None,
        }
    }

    /// Returns the wire string representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Functional => "functional",
            Self::Physical => "physical",
            Self::Both => "both",
        }
    }
}

/// Discovery scan parameters.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Descriptive name of the CAN interface, carried into [`Topology::can_interface`].
    pub can_interface: String,
    /// Addressing mode to scan.
    pub can_id_mode: CanIdMode,
    /// Which addressing strategy to use.
    pub addressing: Addressing,
    /// Per-attempt timeout, in milliseconds.
    pub timeout_ms: u32,
    /// Number of retry attempts (each retry waits up to `timeout_ms`).
    pub retries: u32,
    /// Candidate ECUs for the physical scan. Defaults to `0x00..=0x07` if empty.
    pub physical_candidates: Vec<String>,
    /// If `true`, the physical scan only admits an ECU on a positive `50 01`
    /// response; otherwise any response counts.
    pub probe_session: bool,
}

impl ScanConfig {
    /// Builds a scan config with the default physical candidate range (`00..=07`).
    pub fn new(can_interface: &str, can_id_mode: CanIdMode, addressing: Addressing) -> Self {
        Self {
            can_interface: can_interface.to_string(),
            can_id_mode,
            addressing,
            timeout_ms: 200,
            retries: 1,
            physical_candidates: (0x00..=0x07u32).map(|e| format!("{:02X}", e)).collect(),
            probe_session: false,
        }
    }
}

/// Errors raised while scanning. Scanning itself never fails on "nothing found" --
/// these are infrastructure failures (bad ECU address in the candidate list, a
/// transport error reading the bus).
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// A configured candidate ECU address was malformed.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// The underlying transport failed outright (not a timeout).
    #[error(transparent)]
    Transport(#[from] crate::can::TransportError),
}

fn functional_id(can_id_mode: CanIdMode) -> u32 {
    match can_id_mode {
        CanIdMode::Bit11 => FUNCTIONAL_ID_11BIT,
        CanIdMode::Bit29 => FUNCTIONAL_ID_29BIT,
    }
}

/// Runs a functional scan: broadcasts `10 01` to the functional id and collects
/// every inbound frame matching the addressing mode across `retries` attempts.
fn scan_functional(
    transport: &mut dyn CanTransport,
    config: &ScanConfig,
) -> Result<Vec<EcuNode>, DiscoveryError> {
    let fid = functional_id(config.can_id_mode);
    log::info!(
        "functional scan: interface={} mode={} timeout_ms={} retries={}",
        config.can_interface,
        config.can_id_mode,
        config.timeout_ms,
        config.retries
    );

    for _ in 0..MAX_DRAIN_FRAMES {
        match transport.recv(0)? {
            Some(_) => continue,
            None => break,
        }
    }

    let mut found: Vec<EcuNode> = Vec::new();
    for _ in 0..=config.retries {
        let mut data = vec![0u8; 8];
        data[0] = DIAGNOSTIC_SESSION_CONTROL_REQUEST[0];
        data[1] = DIAGNOSTIC_SESSION_CONTROL_REQUEST[1];
        transport.send(fid, &data)?;

        let deadline = std::time::Instant::now() + std::time::Duration::from_millis(config.timeout_ms as u64);
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now()).as_millis() as u32;
            if remaining == 0 {
                break;
            }
            let frame = match transport.recv(remaining)? {
                Some(f) => f,
                None => break,
            };
            let Some(ecu) = infer_ecu_from_response_id(frame.can_id, config.can_id_mode) else {
                continue;
            };
            let uds_confirmed = is_single_frame_positive_session(&frame.data, DEFAULT_SESSION);
            merge_node(&mut found, &ecu, config.can_id_mode, uds_confirmed, "seen:functional")?;
        }
    }
    Ok(found)
}

fn is_single_frame_positive_session(data: &[u8], session: u8) -> bool {
    // PCI single-frame: byte 0 low nibble is the length, payload starts at byte 1.
    if data.is_empty() {
        return false;
    }
    let len = (data[0] & 0x0F) as usize;
    len >= 2 && data.len() >= 1 + len && data[1] == 0x50 && data[2] == session
}

/// Runs a physical scan: for each candidate ECU, opens an ISO-TP endpoint and
/// sends `10 01`, admitting the node on the first response (or only on a positive
/// `50 01` if `probe_session` is set).
fn scan_physical(
    transport: &mut dyn CanTransport,
    config: &ScanConfig,
    already_found: &[String],
) -> Result<Vec<EcuNode>, DiscoveryError> {
    log::info!(
        "physical scan: interface={} mode={} timeout_ms={} retries={} probe_session={}",
        config.can_interface,
        config.can_id_mode,
        config.timeout_ms,
        config.retries,
        config.probe_session
    );

    let mut candidates: Vec<String> = config.physical_candidates.clone();
    for ecu in already_found {
        if !candidates.contains(ecu) {
            candidates.push(ecu.clone());
        }
    }

    let mut found = Vec::new();
    for ecu in &candidates {
        let (tx_id, rx_id) = ids_for_ecu(ecu, config.can_id_mode)?;
        for _ in 0..=config.retries {
            let mut isotp = IsoTpTransport::new(transport, tx_id, rx_id, config.timeout_ms);
            if isotp.send(&DIAGNOSTIC_SESSION_CONTROL_REQUEST).is_err() {
                continue;
            }
            match isotp.recv_response() {
                Ok(resp) => {
                    let positive = resp.len() >= 2 && resp[0] == 0x50 && resp[1] == DEFAULT_SESSION;
                    if config.probe_session && !positive {
                        continue;
                    }
                    merge_node(&mut found, ecu, config.can_id_mode, positive, "seen:physical")?;
                    break;
                }
                Err(IsoTpError::Timeout(_)) => continue,
                Err(_) => continue,
            }
        }
    }
    Ok(found)
}

fn merge_node(
    nodes: &mut Vec<EcuNode>,
    ecu: &str,
    can_id_mode: CanIdMode,
    uds_confirmed: bool,
    note: &str,
) -> Result<(), DiscoveryError> {
    if let Some(existing) = nodes.iter_mut().find(|n| n.ecu == ecu) {
        existing.uds_confirmed |= uds_confirmed;
        if !existing.notes.iter().any(|n| n == note) {
            existing.notes.push(note.to_string());
            existing.notes.sort();
        }
    } else {
        let mut node = EcuNode::new(ecu, can_id_mode)?;
        node.uds_confirmed = uds_confirmed;
        node.notes = vec![note.to_string()];
        nodes.push(node);
    }
    Ok(())
}

/// Runs a full discovery scan per `config`, merging functional/physical results by
/// ECU address and sorting the result by ECU. `brand` resolves display
/// names for discovered nodes; `transport` is the bus to scan.
pub fn scan(
    transport: &mut dyn CanTransport,
    config: &ScanConfig,
    brand: Option<&str>,
) -> Result<Topology, DiscoveryError> {
    let mut nodes: Vec<EcuNode> = Vec::new();

    if matches!(config.addressing, Addressing::Functional | Addressing::Both) {
        for n in scan_functional(transport, config)? {
            merge_node(&mut nodes, &n.ecu, config.can_id_mode, n.uds_confirmed, "seen:functional")?;
        }
    }
    if matches!(config.addressing, Addressing::Physical | Addressing::Both) {
        let already: Vec<String> = nodes.iter().map(|n| n.ecu.clone()).collect();
        for n in scan_physical(transport, config, &already)? {
            merge_node(&mut nodes, &n.ecu, config.can_id_mode, n.uds_confirmed, "seen:physical")?;
        }
    }

    for node in &mut nodes {
        node.ecu_name = crate::brands::resolve_ecu_name(&node.ecu, brand);
    }
    nodes.sort_by(|a, b| a.ecu.cmp(&b.ecu));

    log::info!("scan complete: {} ECU(s) found", nodes.len());

    Ok(Topology {
        can_interface: config.can_interface.clone(),
        can_id_mode: config.can_id_mode,
        addressing: config.addressing.as_str().to_string(),
        nodes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::ChannelPair;
    use std::sync::mpsc::{Receiver, Sender};

    fn spawn_scenario_1_responder(
        mut endpoint: crate::sim::ChannelEndpoint,
        stop_rx: Receiver<()>,
    ) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || loop {
            if stop_rx.try_recv().is_ok() {
                return;
            }
            if let Ok(Some(frame)) = endpoint.recv(20) {
                if frame.can_id == FUNCTIONAL_ID_11BIT && frame.data[0..2] == [0x10, 0x01] {
                    let _ = endpoint.send(0x7E8, &[0x06, 0x50, 0x01, 0, 0, 0, 0, 0]);
                    let _ = endpoint.send(0x7EB, &[0x06, 0x50, 0x01, 0, 0, 0, 0, 0]);
                }
            }
        })
    }

    #[test]
    fn scenario_1_functional_scan_two_ecus() {
        let (mut tester, ecu_side) = ChannelPair::new();
        let (stop_tx, stop_rx): (Sender<()>, Receiver<()>) = std::sync::mpsc::channel();
        let handle = spawn_scenario_1_responder(ecu_side, stop_rx);

        let config = ScanConfig::new("vcan0", CanIdMode::Bit11, Addressing::Functional);
        let topo = scan(&mut tester, &config, None).unwrap();

        let ecus: Vec<&str> = topo.nodes.iter().map(|n| n.ecu.as_str()).collect();
        assert_eq!(ecus, vec!["00", "03"]);
        assert!(topo.nodes.iter().all(|n| n.uds_confirmed));
        assert!(topo.nodes.iter().all(|n| n.ecu_name == "Unknown ECU"));

        let _ = stop_tx.send(());
        drop(tester);
        let _ = handle.join();
    }

    #[test]
    fn no_response_yields_empty_topology() {
        let (mut tester, _ecu_side) = ChannelPair::new();
        let mut config = ScanConfig::new("vcan0", CanIdMode::Bit11, Addressing::Functional);
        config.timeout_ms = 20;
        let topo = scan(&mut tester, &config, None).unwrap();
        assert!(topo.nodes.is_empty());
    }

    #[test]
    fn physical_scan_admits_first_responder() {
        let (mut tester, ecu_side) = crate::sim::ChannelPair::new();
        let sim = crate::sim::SimEcu::spawn(ecu_side, 0x7E1, 0x7E9, |req| {
            if req == [0x10, 0x01] {
                Some(vec![0x50, 0x01])
            } else {
                None
            }
        });
        let mut config = ScanConfig::new("vcan0", CanIdMode::Bit11, Addressing::Physical);
        config.physical_candidates = vec!["01".to_string()];
        config.timeout_ms = 200;
        let topo = scan(&mut tester, &config, None).unwrap();
        assert_eq!(topo.nodes.len(), 1);
        assert_eq!(topo.nodes[0].ecu, "01");
        assert!(topo.nodes[0].uds_confirmed);
        drop(tester);
        sim.join();
    }
}
