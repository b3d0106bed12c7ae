//! Core containers: conversations, datagrams, and their derived data.
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::fmt;
use std::ops::{Index, IndexMut};

/// One side of a TCP conversation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct Endpoint {
    pub addr: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(addr: &str, port: u16) -> Self {
        Self {
            addr: addr.to_string(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

/// A single packet of a conversation.
///
/// `rtt` starts out unknown and is the only field mutated after
/// construction; the RTT reconstruction pass owns that mutation.
#[derive(Clone, Debug)]
pub struct Datagram {
    pub sent_by_client: bool,
    pub time: DateTime<Utc>,
    pub seq: i64,
    /// Sequence number ACKed by this segment; -1 when no ACK flag was set.
    pub ack: i64,
    pub payload_len: u32,
    pub total_len: u32,
    pub rtt: Option<TimeDelta>,
}

impl Datagram {
    pub fn new(
        sent_by_client: bool,
        time: DateTime<Utc>,
        seq: i64,
        total_len: u32,
        payload_len: u32,
        ack: i64,
    ) -> Self {
        Self {
            sent_by_client,
            time,
            seq,
            ack,
            payload_len,
            total_len,
            rtt: None,
        }
    }
}

/// The eight algorithm name lists carried by one KEXINIT message.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AlgorithmLists {
    pub kex: String,
    pub server_host_key: String,
    pub encryption_client_to_server: String,
    pub encryption_server_to_client: String,
    pub mac_client_to_server: String,
    pub mac_server_to_client: String,
    pub compression_client_to_server: String,
    pub compression_server_to_client: String,
}

/// The negotiated eight-tuple, as picked by the algorithms analyser.
/// A field holds `"unknown"` when no mutual entry was found.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NegotiatedAlgorithms {
    pub kex: String,
    pub server_host_key: String,
    pub encryption_client_to_server: String,
    pub encryption_server_to_client: String,
    pub mac_client_to_server: String,
    pub mac_server_to_client: String,
    pub compression_client_to_server: String,
    pub compression_server_to_client: String,
}

/// Traffic shape of a conversation. The closed set of labels the classifier
/// works with; [Unknown](ConnectionType::Unknown) is the fallback for
/// conversations that were never classified.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum ConnectionType {
    BulkServerToClient,
    BulkClientToServer,
    Shell,
    ReverseShell,
    Tunnel,
    #[default]
    Unknown,
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ConnectionType::BulkServerToClient => "bulk transfer (server to client)",
            ConnectionType::BulkClientToServer => "bulk transfer (client to server)",
            ConnectionType::Shell => "interactive shell",
            ConnectionType::ReverseShell => "reverse interactive shell",
            ConnectionType::Tunnel => "tunnel",
            ConnectionType::Unknown => "unknown",
        };
        write!(f, "{name}")
    }
}

/// A bidirectional TCP conversation, client and server roles resolved.
///
/// Everything except the analysis slots is fixed at construction. Each slot
/// is written at most once, by the analyser that owns it.
#[derive(Clone, Debug)]
pub struct Connection {
    /// 1-based ordinal in capture order.
    pub nb: usize,
    pub client: Endpoint,
    pub server: Endpoint,
    pub start_time: DateTime<Utc>,
    pub duration: TimeDelta,
    /// Raw version-exchange lines, e.g. `SSH-2.0-OpenSSH_5.3 Trisquel-5.5`.
    pub client_protocol: Option<String>,
    pub server_protocol: Option<String>,
    pub client_algos: Option<AlgorithmLists>,
    pub server_algos: Option<AlgorithmLists>,
    /// True when at least one packet carried a recognised SSH message.
    pub ssh: bool,
    /// All datagrams, in non-decreasing time order.
    pub datagrams: Vec<Datagram>,
    pub client_sent_nb_datagrams: usize,
    pub server_sent_nb_datagrams: usize,
    pub client_sent_len: u64,
    pub server_sent_len: u64,

    // Analysis slots.
    pub rtt_assigned: bool,
    pub idle_fraction: Option<f64>,
    pub connection_type: Option<ConnectionType>,
    pub negotiated: Option<NegotiatedAlgorithms>,
    pub stepping_stone: Option<bool>,
    /// Ordinals of the conversations this one coincides with (OFF-period
    /// correlation). Symmetric: the peer lists this conversation too.
    pub stepping_stone_peers: Vec<usize>,
    pub chain_hosts: Option<usize>,
}

impl Connection {
    /// Builds a conversation and computes the per-direction counters.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        nb: usize,
        datagrams: Vec<Datagram>,
        start_time: DateTime<Utc>,
        duration: TimeDelta,
        client: Endpoint,
        server: Endpoint,
        client_protocol: Option<String>,
        server_protocol: Option<String>,
        client_algos: Option<AlgorithmLists>,
        server_algos: Option<AlgorithmLists>,
        ssh: bool,
    ) -> Self {
        let client_sent_nb_datagrams = datagrams.iter().filter(|d| d.sent_by_client).count();
        let server_sent_nb_datagrams = datagrams.len() - client_sent_nb_datagrams;
        let client_sent_len = datagrams
            .iter()
            .filter(|d| d.sent_by_client)
            .map(|d| u64::from(d.total_len))
            .sum();
        let server_sent_len = datagrams
            .iter()
            .filter(|d| !d.sent_by_client)
            .map(|d| u64::from(d.total_len))
            .sum();

        Self {
            nb,
            client,
            server,
            start_time,
            duration,
            client_protocol,
            server_protocol,
            client_algos,
            server_algos,
            ssh,
            datagrams,
            client_sent_nb_datagrams,
            server_sent_nb_datagrams,
            client_sent_len,
            server_sent_len,
            rtt_assigned: false,
            idle_fraction: None,
            connection_type: None,
            negotiated: None,
            stepping_stone: None,
            stepping_stone_peers: Vec::new(),
            chain_hosts: None,
        }
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Connection {}: {} --> {}",
            self.nb, self.client, self.server
        )
    }
}

/// A value per traffic direction, indexed by `sent_by_client`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Ways<T> {
    pub client: T,
    pub server: T,
}

impl<T> Index<bool> for Ways<T> {
    type Output = T;

    fn index(&self, sent_by_client: bool) -> &T {
        if sent_by_client {
            &self.client
        } else {
            &self.server
        }
    }
}

impl<T> IndexMut<bool> for Ways<T> {
    fn index_mut(&mut self, sent_by_client: bool) -> &mut T {
        if sent_by_client {
            &mut self.client
        } else {
            &mut self.server
        }
    }
}

/// Duration as fractional seconds; analyses compare durations as ratios.
pub fn seconds(td: TimeDelta) -> f64 {
    match td.num_microseconds() {
        Some(us) => us as f64 / 1e6,
        None => td.num_seconds() as f64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datagram(sent_by_client: bool, total_len: u32) -> Datagram {
        Datagram::new(sent_by_client, Utc::now(), 0, total_len, 0, -1)
    }

    #[test]
    fn test_counters() {
        let datagrams = vec![
            datagram(true, 100),
            datagram(false, 250),
            datagram(true, 60),
            datagram(false, 40),
            datagram(false, 40),
        ];
        let conn = Connection::new(
            1,
            datagrams,
            Utc::now(),
            TimeDelta::zero(),
            Endpoint::new("1.2.3.4", 51022),
            Endpoint::new("5.6.7.8", 22),
            None,
            None,
            None,
            None,
            true,
        );
        assert_eq!(2, conn.client_sent_nb_datagrams);
        assert_eq!(3, conn.server_sent_nb_datagrams);
        assert_eq!(160, conn.client_sent_len);
        assert_eq!(330, conn.server_sent_len);
    }

    #[test]
    fn test_ways_indexing() {
        let mut ways = Ways {
            client: 0u32,
            server: 0u32,
        };
        ways[true] += 2;
        ways[false] += 5;
        assert_eq!(2, ways.client);
        assert_eq!(5, ways.server);
    }

    #[test]
    fn test_endpoint_display() {
        assert_eq!(
            "192.168.0.45:22",
            Endpoint::new("192.168.0.45", 22).to_string()
        );
    }

    #[test]
    fn test_seconds() {
        assert_eq!(0.5, seconds(TimeDelta::milliseconds(500)));
        assert_eq!(-2.0, seconds(TimeDelta::seconds(-2)));
    }
}
