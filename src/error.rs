//! Typed errors at the frame codec boundary.

use crate::config::ErrorCorrection;

/// Failures of the QR frame codec.
///
/// Everything above the codec (subprocesses, files, discovery) reports through
/// `anyhow`; these variants exist so callers can tell a configuration problem
/// from a frame that could not be read back.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The base64 text of a frame payload does not fit in any QR version at
    /// the chosen error-correction level.
    #[error(
        "payload of {payload_len} bytes ({encoded_len} base64 chars) exceeds QR capacity at error correction {ec}; lower --slice-len or --error-correction"
    )]
    PayloadTooLarge {
        payload_len: usize,
        encoded_len: usize,
        ec: ErrorCorrection,
    },

    /// Every recognizer in the cascade failed on this frame.
    #[error("frame {frame} unrecognized after stages [{}]", attempts.join("; "))]
    Unrecognized { frame: u64, attempts: Vec<String> },

    /// The index frame decoded but its JSON is not a valid header.
    #[error("invalid index frame: {0}")]
    InvalidHeader(String),

    #[error("qr encoder: {0}")]
    Qr(String),
}

/// Why a single recognition stage gave up.
#[derive(Debug, thiserror::Error)]
pub enum RecognizeError {
    /// The stage ran but found no symbol.
    #[error("no code found: {0}")]
    NotFound(String),

    /// The stage is not usable in this run (missing script, batch mode).
    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}
