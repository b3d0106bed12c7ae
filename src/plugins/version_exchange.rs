//! Version-exchange (banner) parsing, RFC 4253 section 4.2.
use crate::analyser::containers::Connection;
use crate::analyser::error::AnalysisError;
use crate::plugins::SingleConnectionAnalyser;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// A parsed `SSH-protoversion-softwareversion SP comments` line.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VersionExchange {
    pub protocol_version: String,
    pub software_version: String,
    pub comment: Option<String>,
}

impl FromStr for VersionExchange {
    type Err = AnalysisError;

    /// Splits the line on the first space into identification and comment,
    /// and the identification on its first two hyphens. Anything else is a
    /// malformed banner.
    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let bad = || AnalysisError::BadBanner(line.to_string());
        let trimmed = line.trim_matches(|c| c == ' ' || c == '\r' || c == '\n');
        let (identification, comment) = match trimmed.split_once(' ') {
            Some((identification, comment)) => (identification, Some(comment)),
            None => (trimmed, None),
        };
        let mut parts = identification.splitn(3, '-');
        let (Some(label), Some(protocol_version), Some(software_version)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(bad());
        };
        if label != "SSH" || protocol_version.is_empty() || software_version.is_empty() {
            return Err(bad());
        }
        Ok(Self {
            protocol_version: protocol_version.to_string(),
            software_version: software_version.to_string(),
            comment: comment.map(str::to_string),
        })
    }
}

impl fmt::Display for VersionExchange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SSH-{}-{}", self.protocol_version, self.software_version)?;
        if let Some(comment) = &self.comment {
            write!(f, " {comment}")?;
        }
        Ok(())
    }
}

/// Reports the protocol versions announced by client and server.
#[derive(Debug, Default)]
pub struct ProtocolVersionExchange {
    client: Option<VersionExchange>,
    server: Option<VersionExchange>,
}

const FIELDS: &[&str] = &[
    "Client SSH version",
    "Server SSH version",
    "Client software version",
    "Server software version",
    "Client protocol comment",
    "Server protocol comment",
];

impl SingleConnectionAnalyser for ProtocolVersionExchange {
    fn name(&self) -> &'static str {
        "protocol-version-exchange"
    }

    fn description(&self) -> &'static str {
        "Displays the protocol version announced by client and server"
    }

    fn result_fields(&self) -> Result<&'static [&'static str], AnalysisError> {
        Ok(FIELDS)
    }

    fn analyse(&mut self, connection: &mut Connection) -> Result<(), AnalysisError> {
        self.client = None;
        self.server = None;
        if connection.client_protocol.is_none() && connection.server_protocol.is_none() {
            return Err(AnalysisError::NoMatch);
        }
        self.client = connection
            .client_protocol
            .as_deref()
            .map(VersionExchange::from_str)
            .transpose()?;
        self.server = connection
            .server_protocol
            .as_deref()
            .map(VersionExchange::from_str)
            .transpose()?;
        Ok(())
    }

    fn result_repr(&self) -> Vec<(&'static str, String)> {
        let mut out = Vec::new();
        if let Some(client) = &self.client {
            out.push((FIELDS[0], client.protocol_version.clone()));
            out.push((FIELDS[2], client.software_version.clone()));
            if let Some(comment) = &client.comment {
                out.push((FIELDS[4], comment.clone()));
            }
        }
        if let Some(server) = &self.server {
            out.push((FIELDS[1], server.protocol_version.clone()));
            out.push((FIELDS[3], server.software_version.clone()));
            if let Some(comment) = &server.comment {
                out.push((FIELDS[5], comment.clone()));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Result<VersionExchange, AnalysisError> {
        line.parse()
    }

    #[test]
    fn test_with_comment() {
        assert_eq!(
            VersionExchange {
                protocol_version: "2.0".to_string(),
                software_version: "OpenSSH_5.3".to_string(),
                comment: Some("Trisquel-5.5".to_string()),
            },
            parse("SSH-2.0-OpenSSH_5.3 Trisquel-5.5\r\n").unwrap()
        );
    }

    #[test]
    fn test_without_comment() {
        assert_eq!(
            VersionExchange {
                protocol_version: "1.99".to_string(),
                software_version: "OpenSSH_5.2".to_string(),
                comment: None,
            },
            parse("SSH-1.99-OpenSSH_5.2").unwrap()
        );
    }

    #[test]
    fn test_trailing_space() {
        let parsed = parse("SSH-2.0-OpenSSH_5.2 \r\n").unwrap();
        assert_eq!("OpenSSH_5.2", parsed.software_version);
        assert_eq!(None, parsed.comment);
    }

    #[test]
    fn test_hyphenated_software_version() {
        let parsed = parse("SSH-2.0-dropbear-2012.55").unwrap();
        assert_eq!("dropbear-2012.55", parsed.software_version);
    }

    #[test]
    fn test_garbage() {
        assert!(matches!(
            parse("garbage"),
            Err(AnalysisError::BadBanner(_))
        ));
        assert!(matches!(
            parse("SSH-2.0"),
            Err(AnalysisError::BadBanner(_))
        ));
        assert!(matches!(
            parse("TELNET-2.0-whatever"),
            Err(AnalysisError::BadBanner(_))
        ));
    }

    #[test]
    fn test_roundtrip() {
        for line in ["SSH-2.0-OpenSSH_5.3 Trisquel-5.5", "SSH-1.99-OpenSSH_5.2"] {
            let parsed = parse(line).unwrap();
            assert_eq!(line, parsed.to_string());
            assert_eq!(parsed, parse(&parsed.to_string()).unwrap());
        }
    }

    #[test]
    fn test_analyser_soft_failure_without_banners() {
        use crate::analyser::containers::Endpoint;
        use chrono::{TimeDelta, Utc};
        let mut connection = Connection::new(
            1,
            Vec::new(),
            Utc::now(),
            TimeDelta::zero(),
            Endpoint::new("1.2.3.4", 12345),
            Endpoint::new("5.6.7.8", 22),
            None,
            None,
            None,
            None,
            false,
        );
        let mut analyser = ProtocolVersionExchange::default();
        assert!(matches!(
            analyser.analyse(&mut connection),
            Err(AnalysisError::NoMatch)
        ));
    }
}
