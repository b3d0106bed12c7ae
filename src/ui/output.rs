//! Human-readable and JSON conversation reports.
use super::Palette;
use crate::analyser::containers::{Connection, ConnectionType};
use chrono::TimeDelta;
use serde::Serialize;

/// Renders a duration the way a human reads one, e.g. `1h02m03s.250000`.
pub fn format_duration(duration: TimeDelta) -> String {
    let total = duration.num_seconds();
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let mins = (total % 3_600) / 60;
    let secs = total % 60;
    let mut s = String::new();
    if days != 0 {
        s.push_str(&format!("{days} day{}, ", if days == 1 { "" } else { "s" }));
    }
    if hours != 0 {
        s.push_str(&format!("{hours}h{mins:02}m{secs:02}s"));
    } else if mins != 0 {
        s.push_str(&format!("{mins}m{secs:02}s"));
    } else {
        s.push_str(&format!("{secs}s"));
    }
    let micros = duration.subsec_nanos() / 1_000;
    s.push_str(&format!(".{micros:06}"));
    s
}

/// One-line summary of a conversation.
pub fn print_summary(connection: &Connection, palette: &Palette) {
    println!(
        "{} Connection {:<3}: {}:{} --> {}:{} {}",
        if connection.ssh {
            " ".to_string()
        } else {
            palette.magenta.paint("?").to_string()
        },
        connection.nb,
        palette.blue.paint(format!("{:>16}", connection.client.addr)),
        palette.cyan.paint(format!("{:<5}", connection.client.port)),
        palette.yellow.paint(format!("{:>16}", connection.server.addr)),
        palette.green.paint(format!("{:<5}", connection.server.port)),
        connection.start_time.format("%b %d, %Y %H:%M:%S"),
    );
}

/// Full report of a conversation, extension-analyser fields included.
pub fn print_full(
    connection: &Connection,
    analyser_fields: &[(&'static str, String)],
    palette: &Palette,
) {
    let mut lines: Vec<String> = Vec::new();
    lines.push(format!(
        "Connection {}: {}:{} --> {}:{}",
        connection.nb,
        palette.blue.paint(&connection.client.addr),
        palette.cyan.paint(connection.client.port.to_string()),
        palette.yellow.paint(&connection.server.addr),
        palette.green.paint(connection.server.port.to_string()),
    ));
    if !connection.ssh {
        lines.push(
            palette
                .magenta
                .paint("Not detected as a ssh connection")
                .to_string(),
        );
    }
    lines.push(format!(
        "Start date: {}",
        connection.start_time.format("%b %d, %Y - %H:%M:%S")
    ));
    lines.push(format!("Duration: {}", format_duration(connection.duration)));
    lines.push(format!(
        "Datagrams sent by client: {} ({} bytes)",
        palette
            .blue
            .paint(connection.client_sent_nb_datagrams.to_string()),
        palette.blue.paint(connection.client_sent_len.to_string()),
    ));
    lines.push(format!(
        "Datagrams sent by server: {} ({} bytes)",
        palette
            .yellow
            .paint(connection.server_sent_nb_datagrams.to_string()),
        palette.yellow.paint(connection.server_sent_len.to_string()),
    ));
    if let Some(idle) = connection.idle_fraction {
        lines.push(format!("Idle time: {:.1}%", idle * 100.0));
    }
    lines.push(format!(
        "Connection type: {}",
        connection.connection_type.unwrap_or_default()
    ));
    for (field, value) in analyser_fields {
        lines.push(format!("{field}: {value}"));
    }

    println!();
    for line in lines {
        println!("  {line}");
    }
}

/// Prints one inter-connection analyser result block.
pub fn print_inter_result(result: &str) {
    println!("\n{result}");
}

/// Serializable digest of one conversation, for `--json`.
#[derive(Debug, Serialize)]
pub struct ConnectionReport<'a> {
    pub nb: usize,
    pub ssh: bool,
    pub client: &'a crate::analyser::containers::Endpoint,
    pub server: &'a crate::analyser::containers::Endpoint,
    pub start_time: String,
    pub duration_seconds: f64,
    pub client_sent_nb_datagrams: usize,
    pub server_sent_nb_datagrams: usize,
    pub client_sent_len: u64,
    pub server_sent_len: u64,
    pub idle_fraction: Option<f64>,
    pub connection_type: ConnectionType,
    pub negotiated: Option<&'a crate::analyser::containers::NegotiatedAlgorithms>,
    pub stepping_stone: Option<bool>,
    pub stepping_stone_peers: &'a [usize],
    pub chain_hosts: Option<usize>,
}

impl<'a> ConnectionReport<'a> {
    pub fn new(connection: &'a Connection) -> Self {
        Self {
            nb: connection.nb,
            ssh: connection.ssh,
            client: &connection.client,
            server: &connection.server,
            start_time: connection.start_time.to_rfc3339(),
            duration_seconds: crate::analyser::containers::seconds(connection.duration),
            client_sent_nb_datagrams: connection.client_sent_nb_datagrams,
            server_sent_nb_datagrams: connection.server_sent_nb_datagrams,
            client_sent_len: connection.client_sent_len,
            server_sent_len: connection.server_sent_len,
            idle_fraction: connection.idle_fraction,
            connection_type: connection.connection_type.unwrap_or_default(),
            negotiated: connection.negotiated.as_ref(),
            stepping_stone: connection.stepping_stone,
            stepping_stone_peers: &connection.stepping_stone_peers,
            chain_hosts: connection.chain_hosts,
        }
    }
}

/// All conversations as a JSON array, ready to pipe to jq.
pub fn data_as_json(connections: &[Connection]) -> Result<String, serde_json::Error> {
    let reports: Vec<ConnectionReport> = connections.iter().map(ConnectionReport::new).collect();
    serde_json::to_string(&reports)
}
