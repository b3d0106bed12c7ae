//! Round-trip-time reconstruction.
//!
//! Two phases: pair each datagram with the closest later ACK travelling the
//! other way, then fill the gaps by linear interpolation between the paired
//! anchors. When only one direction ever gets ACK-derived estimates, they
//! are first copied onto the opposite direction.
use super::containers::{Connection, Ways};
use chrono::{DateTime, TimeDelta, Utc};

/// Assigns an RTT estimate to every datagram of the conversation.
///
/// On success `rtt_assigned` is set and every datagram carries an estimate;
/// when no ACK in either direction could be paired, `rtt_assigned` stays
/// false and every datagram keeps its unknown RTT.
pub fn compute(connection: &mut Connection) {
    log::info!("Computing RTTs for connection {}", connection.nb);

    // Phase 1: walk backwards, remembering per direction the most recent
    // segment that carried an ACK. A datagram covered by the stored ACK of
    // the opposite direction gets twice the one-way delay; multiple ACKs in
    // one are collapsed to the nearest ACKing segment.
    let mut last_acking: Ways<Option<(DateTime<Utc>, i64)>> = Ways::default();
    let mut has_rtt = Ways {
        client: false,
        server: false,
    };
    for datagram in connection.datagrams.iter_mut().rev() {
        if let Some((time, ack)) = last_acking[!datagram.sent_by_client] {
            if datagram.seq < ack {
                datagram.rtt = Some((time - datagram.time) * 2);
                has_rtt[datagram.sent_by_client] = true;
                last_acking[!datagram.sent_by_client] = None;
            }
        }
        if datagram.ack > -1 {
            last_acking[datagram.sent_by_client] = Some((datagram.time, datagram.ack));
        }
    }

    if !has_rtt.client && !has_rtt.server {
        log::warn!("Failed to compute RTTs for connection {}", connection.nb);
        connection.rtt_assigned = false;
        return;
    }

    // Phase 1b: a single direction got estimates; hand each one to the next
    // unestimated datagram of the other direction.
    if has_rtt.client != has_rtt.server {
        let way = has_rtt.client;
        let mut last_rtt: Option<TimeDelta> = None;
        for datagram in connection.datagrams.iter_mut() {
            if datagram.sent_by_client == way {
                last_rtt = datagram.rtt;
            } else if let Some(rtt) = last_rtt.take() {
                datagram.rtt = Some(rtt);
            }
        }
    }

    // Phase 2: forward scan per direction. Datagrams without an estimate
    // queue up until the next anchor; the queue is then resolved by flat
    // extrapolation (no anchor yet) or linear interpolation (two anchors).
    let mut last_rtt: Ways<Option<TimeDelta>> = Ways::default();
    let mut pending: Ways<Vec<usize>> = Ways::default();
    for index in 0..connection.datagrams.len() {
        let way = connection.datagrams[index].sent_by_client;
        let Some(rtt) = connection.datagrams[index].rtt else {
            pending[way].push(index);
            continue;
        };
        if !pending[way].is_empty() {
            match last_rtt[way] {
                None => {
                    for &queued in &pending[way] {
                        connection.datagrams[queued].rtt = Some(rtt);
                    }
                }
                Some(previous) => {
                    let step = (rtt - previous) / (1 + pending[way].len() as i32);
                    for (offset, &queued) in pending[way].iter().enumerate() {
                        connection.datagrams[queued].rtt =
                            Some(previous + step * (offset as i32 + 1));
                    }
                }
            }
            pending[way].clear();
        }
        last_rtt[way] = Some(rtt);
    }
    // Trailing datagrams extend the last anchor of their direction.
    for way in [true, false] {
        if let Some(rtt) = last_rtt[way] {
            for &queued in &pending[way] {
                connection.datagrams[queued].rtt = Some(rtt);
            }
        }
    }

    // A direction may have had no anchor at all (every estimate of the other
    // direction preceded it); borrow the nearest assigned estimate so the
    // conversation ends up fully estimated or not at all.
    if last_rtt.client.is_none() || last_rtt.server.is_none() {
        let mut borrowed: Option<TimeDelta> = None;
        for datagram in connection.datagrams.iter_mut() {
            match datagram.rtt {
                Some(rtt) => borrowed = Some(rtt),
                None => datagram.rtt = borrowed,
            }
        }
        let mut borrowed: Option<TimeDelta> = None;
        for datagram in connection.datagrams.iter_mut().rev() {
            match datagram.rtt {
                Some(rtt) => borrowed = Some(rtt),
                None => datagram.rtt = borrowed,
            }
        }
    }

    connection.rtt_assigned = true;
}
