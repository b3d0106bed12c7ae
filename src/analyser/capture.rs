//! Capture-file ingest: drives tshark and groups its output into
//! [Connection]s.
//!
//! Three passes per capture: enumerate TCP ports (to install SSH dissection
//! hints on every port), discover streams and version-exchange banners, and
//! finally extract every datagram of the selected streams.
use super::containers::{AlgorithmLists, Connection, Datagram, Endpoint};
use super::error::AnalysisError;
use chrono::{DateTime, Utc};
use rtshark::Packet;
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::Path;

/// Metadata kept in the stream-discovery pass.
const STREAM_FIELDS: &[&str] = &[
    "frame.time_epoch",
    "tcp.stream",
    "ip.src",
    "ipv6.src",
    "tcp.srcport",
    "ip.dst",
    "ipv6.dst",
    "tcp.dstport",
    "ssh.protocol",
    "ssh.message_code",
];

/// Metadata kept in the datagram-extraction pass.
const DATAGRAM_FIELDS: &[&str] = &[
    "frame.time_epoch",
    "tcp.stream",
    "tcp.seq",
    "tcp.len",
    "frame.len",
    "tcp.ack",
    "ip.src",
    "ipv6.src",
    "tcp.srcport",
    "ssh.kex_algorithms",
    "ssh.server_host_key_algorithms",
    "ssh.encryption_algorithms_client_to_server",
    "ssh.encryption_algorithms_server_to_client",
    "ssh.mac_algorithms_client_to_server",
    "ssh.mac_algorithms_server_to_client",
    "ssh.compression_algorithms_client_to_server",
    "ssh.compression_algorithms_server_to_client",
];

/// Parser for capture files.
pub struct CaptureParser {
    keep_datagrams: bool,
    tshark_cmd: String,
    /// PATH override handed to rtshark when the tshark binary was relocated.
    tshark_dir: Option<String>,
}

impl CaptureParser {
    pub fn new(keep_datagrams: bool, tshark_cmd: Option<&str>) -> Self {
        let tshark_cmd = tshark_cmd.unwrap_or("tshark").to_string();
        let tshark_dir = if tshark_cmd == "tshark" {
            None
        } else {
            // rtshark finds the binary through PATH, so a file path is
            // turned into its containing directory.
            let path = Path::new(&tshark_cmd);
            match (path.file_name(), path.parent()) {
                (Some(name), Some(parent))
                    if name.to_str() == Some("tshark") && !parent.as_os_str().is_empty() =>
                {
                    Some(parent.to_string_lossy().into_owned())
                }
                _ => Some(tshark_cmd.clone()),
            }
        };
        Self {
            keep_datagrams,
            tshark_cmd,
            tshark_dir,
        }
    }

    /// Parses the given capture file into [Connection]s, numbered 1-based in
    /// capture order.
    ///
    /// `connections_nb` restricts the output (and the expensive datagram
    /// pass) to the listed ordinals; `only_ssh` drops streams that never
    /// exchanged an SSH banner.
    pub fn parse(
        &self,
        file: &str,
        connections_nb: Option<&BTreeSet<usize>>,
        only_ssh: bool,
    ) -> Result<Vec<Connection>, AnalysisError> {
        log::info!("Start to parse {file}");

        let ports = self.extract_ports(file)?;
        log::debug!("{} TCP ports seen", ports.len());

        let mut table = StreamTable::default();
        self.extract_streams(file, &ports, only_ssh, &mut table)?;

        if self.keep_datagrams {
            let selected = table.selected_keys(connections_nb);
            if !selected.is_empty() {
                self.extract_datagrams(file, &ports, &selected, &mut table)?;
            }
        }

        let connections = table.into_connections(connections_nb);
        log::info!("Parsing {file} finished");
        Ok(connections)
    }

    /// Pass 1: the set of TCP ports in the capture.
    fn extract_ports(&self, file: &str) -> Result<BTreeSet<u16>, AnalysisError> {
        log::info!("Enumerating TCP ports.");
        let mut builder = rtshark::RTSharkBuilder::builder()
            .input_path(file)
            .display_filter("tcp")
            .metadata_whitelist("tcp.srcport")
            .metadata_whitelist("tcp.dstport");
        if let Some(dir) = &self.tshark_dir {
            builder = builder.env_path(dir);
        }
        let mut rtshark = self.spawn(builder)?;

        let mut ports = BTreeSet::new();
        while let Some(packet) = read(&mut rtshark)? {
            if let Some(tcp) = packet.layer_name("tcp") {
                for key in ["tcp.srcport", "tcp.dstport"] {
                    if let Some(meta) = tcp.metadata(key) {
                        ports.insert(parse_field::<u16>(key, meta.value())?);
                    }
                }
            }
        }
        rtshark.kill();
        Ok(ports)
    }

    /// Pass 2: streams, roles, and version-exchange banners.
    fn extract_streams(
        &self,
        file: &str,
        ports: &BTreeSet<u16>,
        only_ssh: bool,
        table: &mut StreamTable,
    ) -> Result<(), AnalysisError> {
        log::info!("Collecting streams.");
        let decode: Vec<String> = ports.iter().map(|p| format!("tcp.port=={p},ssh")).collect();
        let filter = if only_ssh { "ssh.protocol" } else { "tcp" };

        let mut builder = rtshark::RTSharkBuilder::builder()
            .input_path(file)
            .display_filter(filter);
        for hint in &decode {
            builder = builder.decode_as(hint);
        }
        for field in STREAM_FIELDS {
            builder = builder.metadata_whitelist(field);
        }
        if let Some(dir) = &self.tshark_dir {
            builder = builder.env_path(dir);
        }
        let mut rtshark = self.spawn(builder)?;

        while let Some(packet) = read(&mut rtshark)? {
            if let Some(fields) = StreamFields::from_packet(&packet)? {
                table.register_stream_packet(fields, only_ssh);
            }
        }
        rtshark.kill();
        Ok(())
    }

    /// Pass 3: every datagram of the selected streams.
    fn extract_datagrams(
        &self,
        file: &str,
        ports: &BTreeSet<u16>,
        streams: &[String],
        table: &mut StreamTable,
    ) -> Result<(), AnalysisError> {
        log::info!("Extracting datagrams.");
        let decode: Vec<String> = ports.iter().map(|p| format!("tcp.port=={p},ssh")).collect();
        let filter = streams
            .iter()
            .map(|s| format!("tcp.stream=={s}"))
            .collect::<Vec<_>>()
            .join(" or ");

        let mut builder = rtshark::RTSharkBuilder::builder()
            .input_path(file)
            .display_filter(&filter);
        for hint in &decode {
            builder = builder.decode_as(hint);
        }
        for field in DATAGRAM_FIELDS {
            builder = builder.metadata_whitelist(field);
        }
        if let Some(dir) = &self.tshark_dir {
            builder = builder.env_path(dir);
        }
        let mut rtshark = self.spawn(builder)?;

        while let Some(packet) = read(&mut rtshark)? {
            if let Some(fields) = DatagramFields::from_packet(&packet)? {
                table.register_datagram(fields);
            }
        }
        rtshark.kill();
        Ok(())
    }

    fn spawn(
        &self,
        builder: rtshark::RTSharkBuilderReady,
    ) -> Result<rtshark::RTShark, AnalysisError> {
        builder.spawn().map_err(|err| {
            log::error!("Error spawning tshark: {err}");
            if err.kind() == io::ErrorKind::NotFound {
                AnalysisError::DecoderMissing(self.tshark_cmd.clone())
            } else {
                AnalysisError::DecoderFailure(err.to_string())
            }
        })
    }
}

fn read(rtshark: &mut rtshark::RTShark) -> Result<Option<Packet>, AnalysisError> {
    rtshark
        .read()
        .map_err(|err| AnalysisError::DecoderFailure(err.to_string()))
}

fn parse_field<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, AnalysisError> {
    value
        .parse()
        .map_err(|_| AnalysisError::BadField(format!("{name}: {value:?}")))
}

fn metadata<'a>(packet: &'a Packet, layer: &str, key: &str) -> Option<&'a str> {
    packet
        .layer_name(layer)
        .and_then(|l| l.metadata(key))
        .map(|m| m.value())
}

fn packet_time(packet: &Packet) -> Result<DateTime<Utc>, AnalysisError> {
    packet
        .timestamp_micros()
        .and_then(DateTime::from_timestamp_micros)
        .ok_or_else(|| AnalysisError::BadField("frame.time_epoch".to_string()))
}

/// Endpoint of a packet, v4 or v6.
fn endpoint(
    packet: &Packet,
    ip_key: &str,
    ipv6_key: &str,
    port_key: &str,
) -> Result<Option<Endpoint>, AnalysisError> {
    let addr = match metadata(packet, "ip", ip_key).or_else(|| metadata(packet, "ipv6", ipv6_key)) {
        Some(addr) => addr.to_string(),
        None => return Ok(None),
    };
    let port = match metadata(packet, "tcp", port_key) {
        Some(value) => parse_field(port_key, value)?,
        None => return Ok(None),
    };
    Ok(Some(Endpoint { addr, port }))
}

/// What the stream-discovery pass needs from one packet.
#[derive(Debug)]
struct StreamFields {
    stream: String,
    time: DateTime<Utc>,
    src: Endpoint,
    dst: Endpoint,
    protocol: Option<String>,
    message_code: Option<u32>,
}

impl StreamFields {
    /// Returns `None` for packets without the TCP/IP metadata we group by.
    fn from_packet(packet: &Packet) -> Result<Option<Self>, AnalysisError> {
        let Some(stream) = metadata(packet, "tcp", "tcp.stream") else {
            return Ok(None);
        };
        let stream = stream.to_string();
        let (Some(src), Some(dst)) = (
            endpoint(packet, "ip.src", "ipv6.src", "tcp.srcport")?,
            endpoint(packet, "ip.dst", "ipv6.dst", "tcp.dstport")?,
        ) else {
            return Ok(None);
        };
        let message_code = match metadata(packet, "ssh", "ssh.message_code") {
            Some(value) => Some(parse_field("ssh.message_code", value)?),
            None => None,
        };
        Ok(Some(Self {
            stream,
            time: packet_time(packet)?,
            src,
            dst,
            protocol: metadata(packet, "ssh", "ssh.protocol").map(str::to_string),
            message_code,
        }))
    }
}

/// What the datagram pass needs from one packet.
#[derive(Debug)]
struct DatagramFields {
    stream: String,
    time: DateTime<Utc>,
    src: Endpoint,
    seq: i64,
    payload_len: u32,
    total_len: u32,
    ack: i64,
    algos: Option<AlgorithmLists>,
}

impl DatagramFields {
    fn from_packet(packet: &Packet) -> Result<Option<Self>, AnalysisError> {
        let Some(stream) = metadata(packet, "tcp", "tcp.stream") else {
            return Ok(None);
        };
        let stream = stream.to_string();
        let Some(src) = endpoint(packet, "ip.src", "ipv6.src", "tcp.srcport")? else {
            return Ok(None);
        };
        let seq = match metadata(packet, "tcp", "tcp.seq") {
            Some(value) => parse_field("tcp.seq", value)?,
            None => return Ok(None),
        };
        let payload_len = match metadata(packet, "tcp", "tcp.len") {
            Some(value) => parse_field("tcp.len", value)?,
            None => 0,
        };
        let total_len = match metadata(packet, "frame", "frame.len") {
            Some(value) => parse_field("frame.len", value)?,
            None => 0,
        };
        // No ACK flag is reported as the -1 sentinel.
        let ack = match metadata(packet, "tcp", "tcp.ack") {
            Some(value) => parse_field("tcp.ack", value)?,
            None => -1,
        };
        let algos = Self::algorithm_lists(packet);
        Ok(Some(Self {
            stream,
            time: packet_time(packet)?,
            src,
            seq,
            payload_len,
            total_len,
            ack,
            algos,
        }))
    }

    /// The eight KEXINIT lists, when this packet carried any of them.
    fn algorithm_lists(packet: &Packet) -> Option<AlgorithmLists> {
        let get = |key| metadata(packet, "ssh", key).map(str::to_string);
        let fields = [
            get("ssh.kex_algorithms"),
            get("ssh.server_host_key_algorithms"),
            get("ssh.encryption_algorithms_client_to_server"),
            get("ssh.encryption_algorithms_server_to_client"),
            get("ssh.mac_algorithms_client_to_server"),
            get("ssh.mac_algorithms_server_to_client"),
            get("ssh.compression_algorithms_client_to_server"),
            get("ssh.compression_algorithms_server_to_client"),
        ];
        if fields.iter().all(Option::is_none) {
            return None;
        }
        let [kex, server_host_key, encryption_client_to_server, encryption_server_to_client, mac_client_to_server, mac_server_to_client, compression_client_to_server, compression_server_to_client] =
            fields.map(Option::unwrap_or_default);
        Some(AlgorithmLists {
            kex,
            server_host_key,
            encryption_client_to_server,
            encryption_server_to_client,
            mac_client_to_server,
            mac_server_to_client,
            compression_client_to_server,
            compression_server_to_client,
        })
    }
}

/// Per-stream accumulation before [Connection]s are built.
#[derive(Debug)]
struct StreamRecord {
    client: Endpoint,
    server: Endpoint,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    client_protocol: Option<String>,
    server_protocol: Option<String>,
    client_algos: Option<AlgorithmLists>,
    server_algos: Option<AlgorithmLists>,
    ssh: bool,
    datagrams: Vec<Datagram>,
}

/// Streams in first-seen order, keyed by the decoder's opaque stream id.
#[derive(Debug, Default)]
struct StreamTable {
    order: Vec<String>,
    records: HashMap<String, StreamRecord>,
}

impl StreamTable {
    /// Folds one packet of the discovery pass into the table.
    ///
    /// The first packet of a stream nominates its source as the client; the
    /// first version-exchange banner overrides that and nominates its sender
    /// as the server.
    fn register_stream_packet(&mut self, fields: StreamFields, only_ssh: bool) {
        let record = self.records.entry(fields.stream.clone()).or_insert_with(|| {
            self.order.push(fields.stream.clone());
            StreamRecord {
                client: fields.src.clone(),
                server: fields.dst.clone(),
                start_time: fields.time,
                end_time: fields.time,
                client_protocol: None,
                server_protocol: None,
                client_algos: None,
                server_algos: None,
                ssh: false,
                datagrams: Vec::new(),
            }
        });
        record.end_time = fields.time;

        if fields.message_code.is_some() || only_ssh {
            record.ssh = true;
        }

        if let Some(protocol) = fields.protocol {
            if record.server_protocol.is_none() {
                // First banner of the stream: its sender is the server.
                record.client = fields.dst.clone();
                record.server = fields.src.clone();
            }
            if record.client == fields.src {
                record.client_protocol = Some(protocol);
            } else {
                record.server_protocol = Some(protocol);
            }
        }
    }

    /// Folds one packet of the datagram pass into the table.
    fn register_datagram(&mut self, fields: DatagramFields) {
        let Some(record) = self.records.get_mut(&fields.stream) else {
            return;
        };
        record.end_time = fields.time;
        let sent_by_client = record.client == fields.src;
        record.datagrams.push(Datagram::new(
            sent_by_client,
            fields.time,
            fields.seq,
            fields.total_len,
            fields.payload_len,
            fields.ack,
        ));
        if let Some(algos) = fields.algos {
            if sent_by_client {
                record.client_algos = Some(algos);
            } else {
                record.server_algos = Some(algos);
            }
        }
    }

    /// Stream keys matching the requested ordinals, in capture order.
    fn selected_keys(&self, connections_nb: Option<&BTreeSet<usize>>) -> Vec<String> {
        self.order
            .iter()
            .enumerate()
            .filter(|(idx, _)| connections_nb.map_or(true, |set| set.contains(&(idx + 1))))
            .map(|(_, key)| key.clone())
            .collect()
    }

    fn into_connections(mut self, connections_nb: Option<&BTreeSet<usize>>) -> Vec<Connection> {
        let mut connections = Vec::new();
        for (idx, key) in self.order.iter().enumerate() {
            let nb = idx + 1;
            if let Some(set) = connections_nb {
                if !set.contains(&nb) {
                    continue;
                }
            }
            let Some(record) = self.records.remove(key) else {
                continue;
            };
            let connection = Connection::new(
                nb,
                record.datagrams,
                record.start_time,
                record.end_time - record.start_time,
                record.client,
                record.server,
                record.client_protocol,
                record.server_protocol,
                record.client_algos,
                record.server_algos,
                record.ssh,
            );
            log::debug!("New connection: {connection}");
            connections.push(connection);
        }
        connections
    }
}
