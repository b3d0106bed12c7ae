//! Idle-time fraction of a conversation.
use super::containers::Connection;
use super::error::AnalysisError;
use chrono::TimeDelta;

/// Bucket width used to split the conversation duration.
pub const INTERVAL_SECS: i64 = 2;

/// Computes the fraction of fixed-width intervals without payload traffic
/// and stores it in the `idle_fraction` slot.
///
/// The duration is cut into intervals of [INTERVAL_SECS]; an interval is
/// busy as soon as it contains one payload-bearing datagram.
pub fn compute(connection: &mut Connection) -> Result<(), AnalysisError> {
    log::info!("Computing idle time for connection {}", connection.nb);

    if connection.duration.is_zero() {
        log::warn!("Connection {} is empty", connection.nb);
        return Err(AnalysisError::InsufficientData("empty connection"));
    }
    let interval = TimeDelta::seconds(INTERVAL_SECS);

    let mut intervals_total = 0u64;
    let mut intervals_idle = 0u64;
    // Upper bound of the interval currently considered busy.
    let mut position = connection.start_time;
    for datagram in &connection.datagrams {
        if datagram.payload_len == 0 {
            // Idle time at the SSH level: payload-less segments do not count.
            continue;
        }
        if datagram.time < position {
            continue; // already got one datagram in this interval
        }
        while datagram.time >= position {
            // this interval is idle, move to the next one
            intervals_idle += 1;
            intervals_total += 1;
            position += interval;
        }
        // in fact, the last one was not idle but busy
        intervals_idle -= 1;
        log::debug!("Busy interval up to {position}");
    }

    if intervals_total == 0 {
        log::warn!("Connection {} carries no payload", connection.nb);
        return Err(AnalysisError::InsufficientData("no payload datagrams"));
    }
    log::debug!("Idle intervals: {intervals_idle}/{intervals_total}");
    connection.idle_fraction = Some(intervals_idle as f64 / intervals_total as f64);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyser::containers::{Datagram, Endpoint};
    use chrono::Utc;

    fn make_connection(times_ms: &[i64], payload_len: u32) -> Connection {
        let start = Utc::now();
        let datagrams: Vec<Datagram> = times_ms
            .iter()
            .map(|&ms| {
                Datagram::new(
                    true,
                    start + TimeDelta::milliseconds(ms),
                    0,
                    payload_len + 40,
                    payload_len,
                    -1,
                )
            })
            .collect();
        let end = datagrams.last().map(|d| d.time).unwrap_or(start);
        Connection::new(
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
        )
    }

    #[test]
    fn test_fully_busy() {
        // One payload datagram every half second: every bucket is busy.
        let times: Vec<i64> = (0..40).map(|i| i * 500).collect();
        let mut connection = make_connection(&times, 32);
        compute(&mut connection).unwrap();
        assert_eq!(Some(0.0), connection.idle_fraction);
    }

    #[test]
    fn test_long_silence() {
        // Payload at 0 s and 10 s: buckets [0,2) busy, [2,10) idle,
        // [10,12) busy again.
        let mut connection = make_connection(&[0, 10_000], 32);
        compute(&mut connection).unwrap();
        assert_eq!(Some(4.0 / 6.0), connection.idle_fraction);
    }

    #[test]
    fn test_fraction_in_range() {
        let times: Vec<i64> = (0..50).map(|i| i * i * 37).collect();
        let mut connection = make_connection(&times, 32);
        compute(&mut connection).unwrap();
        let idle = connection.idle_fraction.unwrap();
        assert!((0.0..=1.0).contains(&idle));
    }

    #[test]
    fn test_empty_connection() {
        let mut connection = make_connection(&[0], 32);
        let err = compute(&mut connection).unwrap_err();
        assert!(matches!(err, AnalysisError::InsufficientData(_)));
        assert_eq!(None, connection.idle_fraction);
    }

    #[test]
    fn test_no_payload() {
        let mut connection = make_connection(&[0, 3_000, 6_000], 0);
        let err = compute(&mut connection).unwrap_err();
        assert!(matches!(err, AnalysisError::InsufficientData(_)));
        assert_eq!(None, connection.idle_fraction);
    }
}
