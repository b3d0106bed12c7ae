//! Error kinds shared by the ingest adapter and the analysers.
use thiserror::Error;

/// Everything that can go wrong while parsing a capture or analysing a
/// conversation.
///
/// The decoder-related variants are fatal at the top level; the rest are
/// local to one analyser and one conversation.
#[derive(Debug, Error)]
pub enum AnalysisError {
    /// The external decoder binary could not be found.
    #[error("tshark is required; the binary used was '{0}' (see --tshark)")]
    DecoderMissing(String),

    /// The external decoder started but did not finish cleanly.
    #[error("error while calling tshark: {0}")]
    DecoderFailure(String),

    /// A field of the decoder output did not parse.
    #[error("error while parsing tshark output: {0}")]
    BadField(String),

    /// A version-exchange line did not follow RFC 4253 section 4.2.
    #[error("malformed version exchange line: {0:?}")]
    BadBanner(String),

    /// The conversation has no round-trip times assigned.
    #[error("no round-trip times available")]
    MissingRtt,

    /// The conversation is too small for the analysis to be meaningful.
    #[error("not enough data: {0}")]
    InsufficientData(&'static str),

    /// The analyser ran but found nothing to report.
    #[error("no match found")]
    NoMatch,
}

impl AnalysisError {
    /// Short class name, for crash logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AnalysisError::DecoderMissing(_) => "DecoderMissing",
            AnalysisError::DecoderFailure(_) => "DecoderFailure",
            AnalysisError::BadField(_) => "BadField",
            AnalysisError::BadBanner(_) => "BadBanner",
            AnalysisError::MissingRtt => "MissingRtt",
            AnalysisError::InsufficientData(_) => "InsufficientData",
            AnalysisError::NoMatch => "NoMatch",
        }
    }

    /// Soft failures are logged as warnings and skip one conversation;
    /// anything else is treated as an analyser crash.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            AnalysisError::NoMatch
                | AnalysisError::MissingRtt
                | AnalysisError::InsufficientData(_)
        )
    }
}
