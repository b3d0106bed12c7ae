//! Traffic-shape classification from payload asymmetry and reply timing.
use super::containers::{seconds, Connection, ConnectionType, Ways};
use super::error::AnalysisError;
use chrono::{DateTime, Utc};

/// Minimum server share of the payload for a server-to-client bulk transfer.
pub const BULK_DOWN_MIN_ASYMMETRY: f64 = 0.95;
/// Maximum server share of the payload for a client-to-server bulk transfer.
pub const BULK_UP_MAX_ASYMMETRY: f64 = 0.05;
/// A reply counts as prompt when it arrives within this many RTTs.
pub const SHELL_MAX_TIME_TO_REPLY: f64 = 0.7;
/// Minimum fraction of prompt replies for an interactive classification.
pub const SHELL_MIN_REPLIES: f64 = 0.6;

/// Labels the conversation and stores the result in the
/// `connection_type` slot.
///
/// Decision order: payload asymmetry first (bulk transfers), reply ratios
/// second (interactive shells), tunnel as the unconditional fallback.
pub fn compute(connection: &mut Connection) -> Result<(), AnalysisError> {
    log::info!("Classifying connection {}", connection.nb);

    let ratio_server_sent = asymmetry(connection);
    if ratio_server_sent > 0.5 {
        log::debug!(
            "Asymmetry ratio for bulk (down): {ratio_server_sent:.2} (min {BULK_DOWN_MIN_ASYMMETRY:.2} required)"
        );
        if ratio_server_sent >= BULK_DOWN_MIN_ASYMMETRY {
            return found(connection, ConnectionType::BulkServerToClient);
        }
    } else {
        log::debug!(
            "Asymmetry ratio for bulk (up): {ratio_server_sent:.2} (max {BULK_UP_MAX_ASYMMETRY:.2} required)"
        );
        if ratio_server_sent <= BULK_UP_MAX_ASYMMETRY {
            return found(connection, ConnectionType::BulkClientToServer);
        }
    }

    // The reply ratios divide by the RTT of the replied-to datagram.
    if !connection.rtt_assigned {
        return Err(AnalysisError::MissingRtt);
    }
    let time_to_reply = time_to_reply(connection);

    // Replies to client datagrams decide "shell", replies to server
    // datagrams decide "reverse shell".
    for (way, label) in [
        (true, ConnectionType::Shell),
        (false, ConnectionType::ReverseShell),
    ] {
        let replies = &time_to_reply[way];
        if replies.is_empty() {
            continue;
        }
        let prompt = replies
            .iter()
            .filter(|&&ratio| ratio <= SHELL_MAX_TIME_TO_REPLY)
            .count();
        let ratio = prompt as f64 / replies.len() as f64;
        log::debug!("Replies ratio for {label}: {ratio:.2} (min {SHELL_MIN_REPLIES:.2} required)");
        if ratio >= SHELL_MIN_REPLIES {
            return found(connection, label);
        }
    }

    found(connection, ConnectionType::Tunnel)
}

fn found(connection: &mut Connection, label: ConnectionType) -> Result<(), AnalysisError> {
    connection.connection_type = Some(label);
    log::info!(
        "Classification of connection {} finished: type is {label}",
        connection.nb
    );
    Ok(())
}

/// Fraction of payload bytes sent by the server; 0 when the server sent
/// nothing.
fn asymmetry(connection: &Connection) -> f64 {
    let mut sent: Ways<f64> = Ways::default();
    for datagram in &connection.datagrams {
        sent[datagram.sent_by_client] += f64::from(datagram.payload_len);
    }
    if sent.server == 0.0 {
        0.0
    } else {
        sent.server / (sent.server + sent.client)
    }
}

/// Reply times normalised by the RTT of the datagram being replied to.
///
/// Indexed by the direction being replied to: `time_to_reply[true]` holds
/// the server's replies to client datagrams.
fn time_to_reply(connection: &Connection) -> Ways<Vec<f64>> {
    let mut time_to_reply: Ways<Vec<f64>> = Ways::default();
    let mut last_datagram: Ways<Option<(DateTime<Utc>, f64)>> = Ways::default();
    for datagram in &connection.datagrams {
        if datagram.payload_len == 0 {
            continue;
        }
        let way = !datagram.sent_by_client;
        if let Some((time, rtt)) = last_datagram[way] {
            if rtt != 0.0 {
                time_to_reply[way].push(seconds(datagram.time - time) / rtt);
            }
        }
        last_datagram[way] = None;
        last_datagram[!way] = Some((
            datagram.time,
            datagram.rtt.map(seconds).unwrap_or_default(),
        ));
    }
    time_to_reply
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyser::containers::{Datagram, Endpoint};
    use chrono::{TimeDelta, Utc};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn finish(datagrams: Vec<Datagram>, rtt_assigned: bool) -> Connection {
        let start = datagrams.first().map(|d| d.time).unwrap_or_else(Utc::now);
        let end = datagrams.last().map(|d| d.time).unwrap_or(start);
        let mut connection = Connection::new(
            1,
            datagrams,
            start,
            end - start,
            Endpoint::new("1.2.3.4", 12345),
            Endpoint::new("5.6.7.8", 22),
            None,
            None,
            None,
            None,
            true,
        );
        connection.rtt_assigned = rtt_assigned;
        connection
    }

    fn with_rtt(mut datagram: Datagram, rtt_us: i64) -> Datagram {
        datagram.rtt = Some(TimeDelta::microseconds(rtt_us));
        datagram
    }

    /// Interactive exchange: keystroke-sized client datagrams, each echoed
    /// well within one RTT.
    fn fake_shell(client_first: bool) -> Connection {
        let mut rng = StdRng::seed_from_u64(42);
        let mut time = Utc::now();
        let mut datagrams = Vec::new();
        for _ in 0..20 {
            time += TimeDelta::microseconds(rng.gen_range(100_000..10_000_000));
            let payload = if rng.gen() { 32 } else { 48 };
            datagrams.push(with_rtt(
                Datagram::new(client_first, time, 0, payload + 40, payload, -1),
                rng.gen_range(500_000..900_000),
            ));
            // Echo within 0.1-0.3 s, always below 0.7 of the 0.5-0.9 s RTT.
            time += TimeDelta::microseconds(rng.gen_range(100_000..300_000));
            let payload = rng.gen_range(0..48);
            datagrams.push(with_rtt(
                Datagram::new(!client_first, time, 0, payload + 40, payload, -1),
                rng.gen_range(500_000..900_000),
            ));
        }
        finish(datagrams, true)
    }

    /// Bulk transfer: large one-way payloads, bare ACKs coming back.
    fn fake_bulk(client_sends: bool) -> Connection {
        let mut rng = StdRng::seed_from_u64(42);
        let mut time = Utc::now();
        let mut datagrams = Vec::new();
        for _ in 0..1_000 {
            time += TimeDelta::microseconds(rng.gen_range(100_000..450_000));
            let payload = rng.gen_range(48..1024);
            datagrams.push(with_rtt(
                Datagram::new(client_sends, time, 0, payload + 40, payload, -1),
                rng.gen_range(500_000..900_000),
            ));
            time += TimeDelta::microseconds(rng.gen_range(100_000..450_000));
            datagrams.push(with_rtt(
                Datagram::new(!client_sends, time, 0, 40, 0, -1),
                rng.gen_range(500_000..900_000),
            ));
        }
        finish(datagrams, true)
    }

    #[test]
    fn test_shell() {
        let mut connection = fake_shell(true);
        compute(&mut connection).unwrap();
        assert_eq!(Some(ConnectionType::Shell), connection.connection_type);
    }

    #[test]
    fn test_reverse_shell() {
        let mut connection = fake_shell(false);
        compute(&mut connection).unwrap();
        assert_eq!(
            Some(ConnectionType::ReverseShell),
            connection.connection_type
        );
    }

    #[test]
    fn test_bulk_up() {
        let mut connection = fake_bulk(true);
        compute(&mut connection).unwrap();
        assert_eq!(
            Some(ConnectionType::BulkClientToServer),
            connection.connection_type
        );
    }

    #[test]
    fn test_bulk_down() {
        let mut connection = fake_bulk(false);
        compute(&mut connection).unwrap();
        assert_eq!(
            Some(ConnectionType::BulkServerToClient),
            connection.connection_type
        );
    }

    #[test]
    fn test_tunnel() {
        // Balanced traffic with replies far beyond one RTT.
        let mut rng = StdRng::seed_from_u64(42);
        let mut time = Utc::now();
        let mut datagrams = Vec::new();
        for _ in 0..50 {
            time += TimeDelta::microseconds(rng.gen_range(2_000_000..10_000_000));
            datagrams.push(with_rtt(
                Datagram::new(true, time, 0, 552, 512, -1),
                rng.gen_range(500_000..900_000),
            ));
            time += TimeDelta::microseconds(rng.gen_range(2_000_000..10_000_000));
            datagrams.push(with_rtt(
                Datagram::new(false, time, 0, 552, 512, -1),
                rng.gen_range(500_000..900_000),
            ));
        }
        let mut connection = finish(datagrams, true);
        compute(&mut connection).unwrap();
        assert_eq!(Some(ConnectionType::Tunnel), connection.connection_type);
    }

    #[test]
    fn test_missing_rtt() {
        // Balanced payloads force the classifier into the reply-ratio rules,
        // which need RTTs.
        let start = Utc::now();
        let datagrams: Vec<Datagram> = (0..20)
            .map(|i| {
                Datagram::new(
                    i % 2 == 0,
                    start + TimeDelta::seconds(i),
                    0,
                    552,
                    512,
                    -1,
                )
            })
            .collect();
        let mut connection = finish(datagrams, false);
        let err = compute(&mut connection).unwrap_err();
        assert!(matches!(err, AnalysisError::MissingRtt));
        assert_eq!(None, connection.connection_type);
    }

    #[test]
    fn test_bulk_without_rtt() {
        // Asymmetry alone settles a bulk transfer, even with no RTTs.
        let start = Utc::now();
        let datagrams: Vec<Datagram> = (0..100)
            .map(|i| Datagram::new(false, start + TimeDelta::seconds(i), 0, 1064, 1024, -1))
            .collect();
        let mut connection = finish(datagrams, false);
        compute(&mut connection).unwrap();
        assert_eq!(
            Some(ConnectionType::BulkServerToClient),
            connection.connection_type
        );
    }
}
