//! Negotiated-algorithm selection, RFC 4253 section 7.1.
//!
//! Most of the eight KEXINIT fields follow the first-client-match rule; the
//! key exchange method and the server host key are coupled through the
//! capabilities the chosen method demands of the host key.
use crate::analyser::containers::{AlgorithmLists, Connection, NegotiatedAlgorithms};
use crate::analyser::error::AnalysisError;
use crate::plugins::SingleConnectionAnalyser;
use lazy_static::lazy_static;
use std::collections::HashSet;

/// Value reported when no mutual entry exists.
pub const UNKNOWN: &str = "unknown";

/// What a key exchange method demands (or a host key algorithm provides).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub encryption: bool,
    pub signature: bool,
}

const fn caps(encryption: bool, signature: bool) -> Capabilities {
    Capabilities {
        encryption,
        signature,
    }
}

lazy_static! {
    /// Known key exchange methods and the host-key capabilities they need.
    /// Patterns ending in `*` match by prefix; names carrying an `@`
    /// (vendor extensions) never match a pattern. List from the IANA
    /// ssh-parameters registry.
    static ref KEX_ALGORITHMS: Vec<(&'static str, Capabilities)> = vec![
        ("diffie-hellman-group-exchange-sha1", caps(false, true)),
        ("diffie-hellman-group-exchange-sha256", caps(false, true)),
        ("diffie-hellman-group1-sha1", caps(false, true)),
        ("diffie-hellman-group14-sha1", caps(false, true)),
        ("diffie-hellman-group14-sha256", caps(false, true)),
        ("diffie-hellman-group16-sha512", caps(false, true)),
        ("diffie-hellman-group18-sha512", caps(false, true)),
        ("curve25519-sha256", caps(false, true)),
        ("curve25519-sha256@libssh.org", caps(false, true)),
        ("sntrup761x25519-sha512@openssh.com", caps(false, true)),
        ("ecdh-sha2-*", caps(false, true)),
        ("ecmqv-sha2", caps(false, true)),
        ("gss-group1-sha1-*", caps(false, false)),
        ("gss-group14-sha1-*", caps(false, false)),
        ("gss-gex-sha1-*", caps(false, false)),
        ("gss-*", caps(false, false)),
        ("rsa1024-sha1", caps(false, true)),
        ("rsa2048-sha256", caps(false, true)),
    ];

    /// Known server host key algorithms and the capabilities they provide.
    static ref SERVER_HOST_KEY_ALGORITHMS: Vec<(&'static str, Capabilities)> = vec![
        ("ssh-dss", caps(false, true)),
        ("ssh-rsa", caps(true, true)),
        ("rsa-sha2-256", caps(true, true)),
        ("rsa-sha2-512", caps(true, true)),
        ("ssh-ed25519", caps(false, true)),
        ("spki-sign-rsa", caps(false, true)),
        ("spki-sign-dss", caps(false, true)),
        ("pgp-sign-rsa", caps(false, true)),
        ("pgp-sign-dss", caps(false, true)),
        ("null", caps(false, false)),
        ("ecdsa-sha2-*", caps(false, true)),
        ("x509v3-ssh-dss", caps(false, true)),
        ("x509v3-ssh-rsa", caps(true, true)),
        ("x509v3-rsa2048-sha256", caps(true, true)),
        ("x509v3-ecdsa-sha2-*", caps(false, true)),
    ];
}

/// Capabilities of `algo` per the given table; unknown algorithms neither
/// demand nor provide anything.
fn lookup(table: &[(&'static str, Capabilities)], algo: &str) -> Capabilities {
    for (pattern, capabilities) in table {
        match pattern.strip_suffix('*') {
            None => {
                if algo == *pattern {
                    return *capabilities;
                }
            }
            Some(prefix) => {
                if algo.starts_with(prefix) && !algo.contains('@') {
                    return *capabilities;
                }
            }
        }
    }
    Capabilities::default()
}

/// First entry of the client list also present in the server list.
fn first_common(client: &str, server: &str) -> String {
    let server: HashSet<&str> = server.split(',').collect();
    client
        .split(',')
        .find(|entry| server.contains(entry))
        .map_or_else(|| UNKNOWN.to_string(), str::to_string)
}

/// Walks the client's kex preferences and picks the first method for which
/// a host key with the demanded capabilities is available in both lists.
fn select_kex_and_host_key(client: &AlgorithmLists, server: &AlgorithmLists) -> (String, String) {
    let server_kex: HashSet<&str> = server.kex.split(',').collect();
    for kex in client.kex.split(',') {
        if !server_kex.contains(kex) {
            continue;
        }
        let needed = lookup(&KEX_ALGORITHMS, kex);
        if let Some(host_key) = select_host_key(client, server, needed) {
            return (kex.to_string(), host_key);
        }
    }
    (UNKNOWN.to_string(), UNKNOWN.to_string())
}

/// First mutual host key providing every demanded capability.
fn select_host_key(
    client: &AlgorithmLists,
    server: &AlgorithmLists,
    needed: Capabilities,
) -> Option<String> {
    let server_keys: HashSet<&str> = server.server_host_key.split(',').collect();
    for algo in client.server_host_key.split(',') {
        if !server_keys.contains(algo) {
            continue;
        }
        let provided = lookup(&SERVER_HOST_KEY_ALGORITHMS, algo);
        if (needed.encryption && !provided.encryption) || (needed.signature && !provided.signature)
        {
            continue;
        }
        return Some(algo.to_string());
    }
    None
}

/// Computes the negotiated eight-tuple from both KEXINIT lists.
pub fn negotiate(client: &AlgorithmLists, server: &AlgorithmLists) -> NegotiatedAlgorithms {
    let (kex, server_host_key) = select_kex_and_host_key(client, server);
    NegotiatedAlgorithms {
        kex,
        server_host_key,
        encryption_client_to_server: first_common(
            &client.encryption_client_to_server,
            &server.encryption_client_to_server,
        ),
        encryption_server_to_client: first_common(
            &client.encryption_server_to_client,
            &server.encryption_server_to_client,
        ),
        mac_client_to_server: first_common(
            &client.mac_client_to_server,
            &server.mac_client_to_server,
        ),
        mac_server_to_client: first_common(
            &client.mac_server_to_client,
            &server.mac_server_to_client,
        ),
        compression_client_to_server: first_common(
            &client.compression_client_to_server,
            &server.compression_client_to_server,
        ),
        compression_server_to_client: first_common(
            &client.compression_server_to_client,
            &server.compression_server_to_client,
        ),
    }
}

/// Reports the algorithms most probably in use.
#[derive(Debug, Default)]
pub struct Algorithms {
    negotiated: Option<NegotiatedAlgorithms>,
}

const FIELDS: &[&str] = &[
    "Key exchange algorithm",
    "Server host key algorithm",
    "Encryption algorithm (client to server)",
    "Encryption algorithm (server to client)",
    "MAC algorithm (client to server)",
    "MAC algorithm (server to client)",
    "Compression algorithm (client to server)",
    "Compression algorithm (server to client)",
];

impl SingleConnectionAnalyser for Algorithms {
    fn name(&self) -> &'static str {
        "algorithms"
    }

    fn description(&self) -> &'static str {
        "Finds the algorithms most probably negotiated"
    }

    fn result_fields(&self) -> Result<&'static [&'static str], AnalysisError> {
        Ok(FIELDS)
    }

    fn analyse(&mut self, connection: &mut Connection) -> Result<(), AnalysisError> {
        self.negotiated = None;
        let (Some(client), Some(server)) = (&connection.client_algos, &connection.server_algos)
        else {
            return Err(AnalysisError::NoMatch);
        };
        let negotiated = negotiate(client, server);
        connection.negotiated = Some(negotiated.clone());
        self.negotiated = Some(negotiated);
        Ok(())
    }

    fn result_repr(&self) -> Vec<(&'static str, String)> {
        let Some(negotiated) = &self.negotiated else {
            return Vec::new();
        };
        vec![
            (FIELDS[0], negotiated.kex.clone()),
            (FIELDS[1], negotiated.server_host_key.clone()),
            (FIELDS[2], negotiated.encryption_client_to_server.clone()),
            (FIELDS[3], negotiated.encryption_server_to_client.clone()),
            (FIELDS[4], negotiated.mac_client_to_server.clone()),
            (FIELDS[5], negotiated.mac_server_to_client.clone()),
            (FIELDS[6], negotiated.compression_client_to_server.clone()),
            (FIELDS[7], negotiated.compression_server_to_client.clone()),
        ]
    }
}
