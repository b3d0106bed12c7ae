//! Stepping-stone detection from coinciding ends of idle periods, after
//! "Detecting Stepping Stones" by Yin Zhang and Vern Paxson.
use crate::analyser::containers::Connection;
use crate::analyser::error::AnalysisError;
use crate::plugins::InterConnectionsAnalyser;
use chrono::{DateTime, TimeDelta, Utc};

/// A silence shorter than this ends an OFF period (5.6 in the paper).
pub const T_IDLE_MS: i64 = 500;
/// Two OFF-ends coincide when closer than this (5.6 in the paper).
pub const DELTA_MS: i64 = 16;
/// First restriction: minimum coincidence fraction.
pub const GAMMA: f64 = 0.45;
/// Second restriction: minimum run of consecutive coincidences.
pub const MINCSC: usize = 2;
/// Second restriction: minimum run relative to the OFF counts.
pub const GAMMA_PRIME: f64 = 0.02;

/// Timestamps of the payload datagrams resuming traffic after a silence
/// shorter than `T_IDLE`.
fn off_ends(connection: &Connection) -> Vec<DateTime<Utc>> {
    let t_idle = TimeDelta::milliseconds(T_IDLE_MS);
    let mut ends = Vec::new();
    let mut datagrams = connection.datagrams.iter();
    let Some(first) = datagrams.next() else {
        return ends;
    };
    let mut last_time = first.time;
    for datagram in datagrams {
        if datagram.payload_len == 0 {
            continue; // consider only datagrams with payload
        }
        if datagram.time - last_time < t_idle {
            ends.push(datagram.time);
        }
        last_time = datagram.time;
    }
    ends
}

/// Marches both OFF-end sequences and counts coincidences plus the longest
/// run of consecutive ones.
fn coincidences(off1: &[DateTime<Utc>], off2: &[DateTime<Utc>]) -> (usize, usize) {
    if off1.is_empty() || off2.is_empty() {
        return (0, 0);
    }
    let delta = TimeDelta::milliseconds(DELTA_MS);
    let (mut i, mut j) = (0usize, 0usize);
    let mut correlated = 0;
    let mut run = 0;
    let mut longest = 0;
    loop {
        let (end1, end2) = (off1[i], off2[j]);
        if end1 - end2 < delta && end2 - end1 < delta {
            run += 1;
            correlated += 1;
            longest = longest.max(run);
        } else {
            run = 0;
        }
        // Advance the smaller timestamp (either one on a tie).
        if end1 > end2 {
            j += 1;
            if j == off2.len() {
                break;
            }
        } else {
            i += 1;
            if i == off1.len() {
                break;
            }
        }
    }
    (correlated, longest)
}

/// Correlates ends of idle periods across every conversation pair.
#[derive(Debug, Default)]
pub struct OffCoincidenceDetection {
    /// Surviving pairs of conversation ordinals, lower ordinal first.
    matches: Vec<(usize, usize)>,
}

impl OffCoincidenceDetection {
    pub fn matches(&self) -> &[(usize, usize)] {
        &self.matches
    }
}

impl InterConnectionsAnalyser for OffCoincidenceDetection {
    fn name(&self) -> &'static str {
        "stepping-stones-onoff"
    }

    fn description(&self) -> &'static str {
        "Detects conversations being part of a stepping stone chain (OFF-period coincidence)"
    }

    fn analyse(&mut self, connections: &mut [Connection]) -> Result<(), AnalysisError> {
        log::info!("Starting OFF-period computation");
        self.matches.clear();

        let offs: Vec<Vec<DateTime<Utc>>> = connections.iter().map(off_ends).collect();
        for first in 0..connections.len() {
            for second in first + 1..connections.len() {
                let (correlated, longest) = coincidences(&offs[first], &offs[second]);
                let floor = offs[first].len().min(offs[second].len()) as f64;
                log::debug!(
                    "Connections {} and {}: {correlated} coincidences, longest run {longest}",
                    connections[first].nb,
                    connections[second].nb
                );
                if (correlated as f64) < GAMMA * floor {
                    continue; // 4.2 timing correlation when OFF periods end
                }
                if longest < MINCSC || (longest as f64) < GAMMA_PRIME * floor {
                    continue; // 4.3 refinements
                }
                self.matches
                    .push((connections[first].nb, connections[second].nb));
            }
        }

        for &(a, b) in &self.matches {
            for connection in connections.iter_mut() {
                if connection.nb == a {
                    connection.stepping_stone_peers.push(b);
                } else if connection.nb == b {
                    connection.stepping_stone_peers.push(a);
                }
            }
        }

        if self.matches.is_empty() {
            return Err(AnalysisError::NoMatch);
        }
        Ok(())
    }

    fn result_repr(&self) -> String {
        let mut s = String::from("Stepping stone links detected (on-off method):");
        if self.matches.is_empty() {
            s.push_str("\n    none");
        } else {
            for (a, b) in &self.matches {
                s.push_str(&format!("\n    {a} <-> {b}"));
            }
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyser::containers::{Datagram, Endpoint};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn connection_from_times(nb: usize, times: &[DateTime<Utc>]) -> Connection {
        let datagrams: Vec<Datagram> = times
            .iter()
            .map(|&time| Datagram::new(true, time, 0, 72, 32, -1))
            .collect();
        let start = times.first().copied().unwrap_or_else(Utc::now);
        let end = times.last().copied().unwrap_or(start);
        Connection::new(
            nb,
            datagrams,
            start,
            end - start,
            Endpoint::new("1.2.3.4", 40000 + nb as u16),
            Endpoint::new("5.6.7.8", 22),
            None,
            None,
            None,
            None,
            true,
        )
    }

    /// Keystroke-and-echo bursts 300 ms apart: every datagram after the
    /// first resumes traffic within `T_IDLE`, and the 10 ms spacing inside
    /// a burst puts successive OFF-ends within one coincidence window.
    fn base_times(start: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        (0..50)
            .flat_map(|i| {
                let burst = start + TimeDelta::milliseconds(i * 300);
                [burst, burst + TimeDelta::milliseconds(10)]
            })
            .collect()
    }

    #[test]
    fn test_off_ends_resume_rule() {
        let start = Utc::now();
        // Gaps: 100 ms (end), 700 ms (silence too long), 100 ms (end).
        let times = [
            start,
            start + TimeDelta::milliseconds(100),
            start + TimeDelta::milliseconds(800),
            start + TimeDelta::milliseconds(900),
        ];
        let connection = connection_from_times(1, &times);
        let ends = off_ends(&connection);
        assert_eq!(vec![times[1], times[3]], ends);
    }

    #[test]
    fn test_jittered_pair_matches() {
        let mut rng = StdRng::seed_from_u64(42);
        let start = Utc::now();
        let times = base_times(start);
        let jittered: Vec<DateTime<Utc>> = times
            .iter()
            .map(|&t| t + TimeDelta::milliseconds(rng.gen_range(-4..=4)))
            .collect();
        let mut connections = vec![
            connection_from_times(1, &times),
            connection_from_times(2, &jittered),
        ];

        let mut detector = OffCoincidenceDetection::default();
        detector.analyse(&mut connections).unwrap();
        assert_eq!(&[(1, 2)], detector.matches());
        assert_eq!(vec![2], connections[0].stepping_stone_peers);
        assert_eq!(vec![1], connections[1].stepping_stone_peers);
    }

    #[test]
    fn test_shifted_stream_does_not_match() {
        let start = Utc::now();
        let times = base_times(start);
        // Same cadence but offset by half the inter-packet gap: every
        // OFF-end lands 50 ms away from its counterpart.
        let shifted: Vec<DateTime<Utc>> = times
            .iter()
            .map(|&t| t + TimeDelta::milliseconds(50))
            .collect();
        let mut connections = vec![
            connection_from_times(1, &times),
            connection_from_times(2, &shifted),
        ];

        let mut detector = OffCoincidenceDetection::default();
        let result = detector.analyse(&mut connections);
        assert!(matches!(result, Err(AnalysisError::NoMatch)));
        assert!(detector.matches().is_empty());
        assert!(connections[0].stepping_stone_peers.is_empty());
    }

    #[test]
    fn test_matches_irreflexive_and_unique() {
        let start = Utc::now();
        let times = base_times(start);
        let mut connections = vec![
            connection_from_times(1, &times),
            connection_from_times(2, &times),
            connection_from_times(3, &times),
        ];
        let mut detector = OffCoincidenceDetection::default();
        detector.analyse(&mut connections).unwrap();
        for &(a, b) in detector.matches() {
            assert!(a < b);
        }
        let mut seen = detector.matches().to_vec();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), detector.matches().len());
        assert_eq!(3, detector.matches().len());
        // Symmetric peer bookkeeping.
        assert_eq!(vec![2, 3], connections[0].stepping_stone_peers);
        assert_eq!(vec![1, 3], connections[1].stepping_stone_peers);
        assert_eq!(vec![1, 2], connections[2].stepping_stone_peers);
    }
}
