//! Client-side connection-chain estimation, after "Matching TCP Packets and
//! Its Application to the Detection of Long Connection Chains on the
//! Internet" by Jianhua Yang and Shou-Hsuan Stephen Huang.
//!
//! Matches client "send" packets with the echoes coming back from the last
//! host of the chain; steps in the resulting RTT curve betray hosts joining
//! or leaving the chain.
use crate::analyser::containers::{seconds, Connection, Datagram};
use crate::analyser::error::AnalysisError;
use crate::plugins::SingleConnectionAnalyser;

/// A send gap above this resets the outstanding-send queue.
pub const QUEUE_RESET_SECS: f64 = 0.5;
/// Matched pairs farther apart than this are discarded as bogus.
pub const MAX_MATCH_SECS: f64 = 1.0;
/// Relative deviation from the local mean tolerated by the smoothing pass.
pub const SMOOTH_TOLERANCE: f64 = 0.05;
/// Relative step between windowed extrema counted as a chain change.
pub const JUMP_THRESHOLD: f64 = 0.2;

/// Round-trip estimates from matched send/echo pairs, in capture order.
fn matched_rtts(connection: &Connection) -> Vec<f64> {
    let mut queue: Vec<&Datagram> = Vec::new();
    let mut previous_send: Option<&Datagram> = None;
    let mut rtts = Vec::new();

    for datagram in &connection.datagrams {
        if datagram.payload_len == 0 {
            continue;
        }
        if datagram.sent_by_client {
            if let Some(previous) = previous_send {
                if seconds(datagram.time - previous.time) > QUEUE_RESET_SECS {
                    queue.clear();
                } else {
                    queue.push(datagram);
                }
            } else {
                queue.push(datagram);
            }
            previous_send = Some(datagram);
        } else {
            // An echo from the last host of the chain.
            if queue.is_empty() {
                continue;
            }
            let send = queue.remove(0);
            if send.ack <= datagram.seq && send.seq < datagram.ack {
                let delay = seconds(datagram.time - send.time);
                if delay < MAX_MATCH_SECS {
                    rtts.push(delay * 2.0);
                }
            }
        }
    }
    rtts
}

/// Drops the noisy head of the curve and keeps points close to their local
/// mean.
fn smooth(curve: &[f64]) -> Vec<f64> {
    let mut result = Vec::new();
    if curve.len() < 23 {
        return result;
    }
    for i in 20..curve.len() - 2 {
        let mean: f64 = curve[i - 2..=i + 2].iter().sum::<f64>() / 5.0;
        if (curve[i] - mean).abs() < SMOOTH_TOLERANCE * curve[i] {
            result.push(curve[i]);
        }
    }
    result
}

/// Counts the jumps of the smoothed curve, giving the largest number of
/// hosts the chain reached.
fn count_jumps(rtt: &[f64]) -> usize {
    let mut jumps = 1usize;
    let mut max_jumps = 1usize;

    if rtt.len() < 6 {
        return jumps;
    }

    let mut i = 5;
    while i < rtt.len() - 1 {
        let left = &rtt[i - 5..=i - 3];
        let right = &rtt[i - 2..=i];
        let min_left = left.iter().copied().fold(f64::INFINITY, f64::min);
        let max_left = left.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let min_right = right.iter().copied().fold(f64::INFINITY, f64::min);
        let max_right = right.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        if min_left - max_right > JUMP_THRESHOLD * max_right && jumps > 1 {
            // The RTT dropped a level: a host left the chain.
            jumps -= 1;
            i += 5;
        } else if min_right - max_left > JUMP_THRESHOLD * max_left {
            // The RTT climbed a level: a host joined the chain.
            jumps += 1;
            i += 5;
            max_jumps = max_jumps.max(jumps);
        }
        i += 1;
    }
    max_jumps
}

/// Estimates the number of hosts in the downstream connection chain.
#[derive(Debug, Default)]
pub struct ClientSideEstimation {
    hosts: Option<usize>,
}

const FIELDS: &[&str] = &["Connection chain (client-side)"];

impl SingleConnectionAnalyser for ClientSideEstimation {
    fn name(&self) -> &'static str {
        "stepping-stones-clientside"
    }

    fn description(&self) -> &'static str {
        "Estimates the number of hosts in the downstream connection chain"
    }

    fn result_fields(&self) -> Result<&'static [&'static str], AnalysisError> {
        Ok(FIELDS)
    }

    fn analyse(&mut self, connection: &mut Connection) -> Result<(), AnalysisError> {
        self.hosts = None;
        log::debug!("Starting client-side analysis of connection {}", connection.nb);
        if connection.datagrams.is_empty() {
            return Err(AnalysisError::InsufficientData("no datagrams"));
        }
        let rtts = matched_rtts(connection);
        let hosts = count_jumps(&smooth(&rtts));
        connection.chain_hosts = Some(hosts);
        self.hosts = Some(hosts);
        Ok(())
    }

    fn result_repr(&self) -> Vec<(&'static str, String)> {
        match self.hosts {
            Some(hosts) => vec![(FIELDS[0], format!("{hosts} hosts"))],
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyser::containers::Endpoint;
    use chrono::{TimeDelta, Utc};

    /// Send/echo exchanges with the given per-exchange echo delays (ms).
    fn exchange_connection(delays_ms: &[i64]) -> Connection {
        let start = Utc::now();
        let mut time = start;
        let mut datagrams = Vec::new();
        let mut seq_client = 100i64;
        let mut seq_server = 500i64;
        for &delay in delays_ms {
            time += TimeDelta::milliseconds(300);
            datagrams.push(Datagram::new(
                true,
                time,
                seq_client,
                72,
                32,
                seq_server,
            ));
            let echo_time = time + TimeDelta::milliseconds(delay);
            datagrams.push(Datagram::new(
                false,
                echo_time,
                seq_server,
                72,
                32,
                seq_client + 32,
            ));
            time = echo_time;
            seq_client += 32;
            seq_server += 32;
        }
        let end = time;
        Connection::new(
            1,
            datagrams,
            start,
            end - start,
            Endpoint::new("1.2.3.4", 40000),
            Endpoint::new("5.6.7.8", 22),
            None,
            None,
            None,
            None,
            true,
        )
    }

    #[test]
    fn test_matching_produces_doubled_delays() {
        let connection = exchange_connection(&[50; 10]);
        let rtts = matched_rtts(&connection);
        assert_eq!(10, rtts.len());
        for rtt in rtts {
            assert!((rtt - 0.1).abs() < 1e-6);
        }
    }

    #[test]
    fn test_flat_curve_is_one_host() {
        let connection = exchange_connection(&[50; 60]);
        let rtts = matched_rtts(&connection);
        let hosts = count_jumps(&smooth(&rtts));
        assert_eq!(1, hosts);
    }

    #[test]
    fn test_climb_counts_a_second_host() {
        // 40 exchanges at ~50 ms, then 40 at ~150 ms: one upward step.
        let mut delays = vec![50i64; 40];
        delays.extend(vec![150i64; 40]);
        let connection = exchange_connection(&delays);
        let rtts = matched_rtts(&connection);
        assert_eq!(80, rtts.len());
        let hosts = count_jumps(&smooth(&rtts));
        assert_eq!(2, hosts);
    }

    #[test]
    fn test_empty_connection_is_insufficient() {
        let mut connection = exchange_connection(&[]);
        let mut analyser = ClientSideEstimation::default();
        let err = analyser.analyse(&mut connection).unwrap_err();
        assert!(matches!(err, AnalysisError::InsufficientData(_)));
    }

    #[test]
    fn test_slot_written() {
        let mut connection = exchange_connection(&[50; 60]);
        let mut analyser = ClientSideEstimation::default();
        analyser.analyse(&mut connection).unwrap();
        assert_eq!(Some(1), connection.chain_hosts);
        assert_eq!(
            vec![("Connection chain (client-side)", "1 hosts".to_string())],
            analyser.result_repr()
        );
    }
}
