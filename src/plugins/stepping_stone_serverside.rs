//! Server-side stepping-stone detection, after "Stepping Stone Detection at
//! The Server Side" by Ruei-Min Lin, Yi-Chun Chou, and Kuan-Ta Chen.
//!
//! Assumes Nagle's algorithm is enabled at the client: a relayed session
//! shows client inter-arrival times locked to the RTT, and keystroke
//! payloads collapsing onto a few sizes.
use crate::analyser::containers::{seconds, Connection};
use crate::analyser::error::AnalysisError;
use crate::plugins::SingleConnectionAnalyser;
use std::collections::BTreeMap;

/// Minimum datagrams for the analysis to apply at all.
pub const MIN_DATAGRAMS: usize = 20;
/// Minimum usable RTT/IAT entries for the divergence predicate.
pub const MIN_ENTRIES: usize = 20;
/// An IAT within this relative distance of the RTT counts as similar.
pub const CLOSE_ENOUGH: f64 = 0.5;
/// Maximum similar fraction for the divergence predicate to fire.
pub const IAT_RTT_DIFFERENT: f64 = 0.01;
/// A payload length joins a cluster within this distance of its center.
pub const IN_GROUP: i64 = 3;
/// Minimum mass of the dominant clusters for the modality predicate.
pub const N_MOD_DIST: f64 = 0.98;

/// Client-sent payload datagrams as (seconds-since-previous, rtt, length).
struct ClientSamples {
    rtts: Vec<f64>,
    iats: Vec<f64>,
    payloads: Vec<i64>,
}

fn client_samples(connection: &Connection) -> ClientSamples {
    let mut rtts = Vec::new();
    let mut iats = Vec::new();
    let mut payloads = Vec::new();
    let mut last_time = None;
    for datagram in &connection.datagrams {
        if !datagram.sent_by_client || datagram.payload_len == 0 {
            continue;
        }
        payloads.push(i64::from(datagram.payload_len));
        if let Some(previous) = last_time {
            iats.push(seconds(datagram.time - previous));
            // The first datagram's RTT is skipped to align with the IATs.
            rtts.push(datagram.rtt.map(seconds).unwrap_or_default());
        }
        last_time = Some(datagram.time);
    }
    ClientSamples {
        rtts,
        iats,
        payloads,
    }
}

/// Predicate (A): the client inter-arrival times diverge from the RTTs.
fn rtt_iat_divergence(samples: &ClientSamples) -> Result<bool, AnalysisError> {
    if samples.rtts.len() < MIN_ENTRIES {
        return Err(AnalysisError::InsufficientData(
            "fewer than 20 usable RTT/IAT entries",
        ));
    }
    let mut similar = 0usize;
    for (&rtt, &iat) in samples.rtts.iter().zip(&samples.iats) {
        if rtt != 0.0 && ((rtt - iat) / rtt).abs() <= CLOSE_ENOUGH {
            similar += 1;
        }
    }
    let ratio = similar as f64 / samples.rtts.len() as f64;
    log::info!("Similarity between IATs and RTTs: {:.2}%", ratio * 100.0);
    Ok(ratio <= IAT_RTT_DIFFERENT)
}

/// Nearest cluster center within [IN_GROUP] of the payload length.
fn closest_group(payload: i64, groups: &BTreeMap<i64, Vec<i64>>) -> Option<i64> {
    let mut closest: Option<(i64, i64)> = None;
    for &center in groups.keys() {
        let distance = (center - payload).abs();
        if distance <= IN_GROUP && closest.map_or(true, |(best, _)| distance < best) {
            closest = Some((distance, center));
        }
    }
    closest.map(|(_, center)| center)
}

/// A cluster may move to its members' mean only when no other cluster sits
/// within [IN_GROUP] of the new center.
fn rekey_possible(center: i64, average: i64, groups: &BTreeMap<i64, Vec<i64>>) -> bool {
    groups
        .keys()
        .all(|&other| other == center || (other - average).abs() > IN_GROUP)
}

/// Predicate (B): the client payload sizes are n-modally distributed.
fn payload_modality(payloads: &[i64]) -> bool {
    let mut groups: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
    for &payload in payloads {
        match closest_group(payload, &groups) {
            None => {
                groups.insert(payload, vec![payload]);
            }
            Some(center) => {
                let members = groups.get_mut(&center).expect("cluster center vanished");
                members.push(payload);
                let average = members.iter().sum::<i64>() / members.len() as i64;
                if average != center && rekey_possible(center, average, &groups) {
                    let members = groups.remove(&center).expect("cluster center vanished");
                    groups.insert(average, members);
                }
            }
        }
    }

    let total = payloads.len();
    let dominant: usize = groups
        .values()
        .map(Vec::len)
        .filter(|&size| 10 * size > total)
        .sum();
    log::info!(
        "n-modulus at {:.2}%",
        dominant as f64 / total as f64 * 100.0
    );
    dominant as f64 > N_MOD_DIST * total as f64
}

/// Flags conversations whose client-side timing or payload sizes betray an
/// upstream relay.
#[derive(Debug, Default)]
pub struct ServerSideDetection {
    verdict: Option<bool>,
}

const FIELDS: &[&str] = &["Stepping stone (server-side)"];

impl SingleConnectionAnalyser for ServerSideDetection {
    fn name(&self) -> &'static str {
        "stepping-stones-serverside"
    }

    fn description(&self) -> &'static str {
        "Detects stepping stones from RTT/IAT divergence and payload-size modality"
    }

    fn result_fields(&self) -> Result<&'static [&'static str], AnalysisError> {
        Ok(FIELDS)
    }

    fn analyse(&mut self, connection: &mut Connection) -> Result<(), AnalysisError> {
        self.verdict = None;
        log::info!("Starting server-side computation");
        if connection.datagrams.len() < MIN_DATAGRAMS {
            return Err(AnalysisError::InsufficientData(
                "fewer than 20 datagrams in connection",
            ));
        }
        if !connection.rtt_assigned {
            return Err(AnalysisError::MissingRtt);
        }

        let samples = client_samples(connection);
        let verdict = rtt_iat_divergence(&samples)? || payload_modality(&samples.payloads);
        log::info!("Is stepping stone: {verdict}");
        connection.stepping_stone = Some(verdict);
        self.verdict = Some(verdict);
        Ok(())
    }

    fn result_repr(&self) -> Vec<(&'static str, String)> {
        match self.verdict {
            Some(verdict) => vec![(FIELDS[0], if verdict { "yes" } else { "no" }.to_string())],
            None => Vec::new(),
        }
    }
}
