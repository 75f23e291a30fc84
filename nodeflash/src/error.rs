use crate::flasher::SessionState;
use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("IO error while using serial port: {0}")]
    Serial(#[from] serial::core::Error),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("Failed to connect to the device")]
    ConnectionFailed,
    #[error("Timeout while running command")]
    Timeout,
    #[error("Invalid SLIP escape sequence: 0xdb {0:#04x}")]
    InvalidEscape(u8),
    #[error("Invalid response header")]
    RespError,
    #[error("Invalid frame: expected {expected} bytes, got {actual}")]
    InvalidFrame { expected: usize, actual: usize },
    #[error("Register access at {addr:#010x} failed: {error:?}")]
    RegisterAccess { addr: u32, error: RomError },
    #[error("{stage} failed: {error:?}")]
    Download { stage: DownloadStage, error: RomError },
    #[error("{op} is not allowed while the session is {state:?}")]
    InvalidState { op: &'static str, state: SessionState },
    #[error("Invalid firmware image: {0}")]
    InvalidImage(&'static str),
    #[error("Suspicious segment {addr:#x},{size}")]
    SuspiciousSegment { addr: u32, size: u32 },
    #[error("No partition table found")]
    MissingPartitionTable,
    #[error("Partition {index} invalid: {reason}")]
    PartitionLayout { index: usize, reason: String },
    #[error("Record page overflow: {0} bytes")]
    RecordPageOverflow(usize),
    #[error("LFS image can not be relocated: {0}")]
    Relocation(&'static str),
    #[error("elf image is not valid")]
    InvalidElf,
    #[error("symbol {0} not found")]
    MissingSymbol(String),
    #[error("section {0} not found")]
    MissingSection(String),
    #[error("Parse error")]
    ParseError(#[from] deku::error::DekuError),
    #[error("Parse toml error")]
    TomlError(#[from] toml::de::Error),
}

/// The (status, error) byte pair returned by the ROM for a failed command.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RomError {
    Success,
    Failed { status: u8, error: u8 },
    /// The response body was too short to carry a status.
    Missing,
}

impl RomError {
    pub fn from_body(body: &[u8]) -> Self {
        match body {
            [0, 0, ..] => RomError::Success,
            [status, error, ..] => RomError::Failed {
                status: *status,
                error: *error,
            },
            _ => RomError::Missing,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RomError::Success)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DownloadStage {
    MemBegin,
    MemBlock,
    MemFinish,
    FlashBegin,
    FlashBlock,
    FlashFinish,
}

impl fmt::Display for DownloadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            DownloadStage::MemBegin => "Entering RAM download mode",
            DownloadStage::MemBlock => "Writing to target RAM",
            DownloadStage::MemFinish => "Leaving RAM download mode",
            DownloadStage::FlashBegin => "Entering flash download mode",
            DownloadStage::FlashBlock => "Writing to target flash",
            DownloadStage::FlashFinish => "Leaving flash download mode",
        };
        f.write_str(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_pair() {
        assert_eq!(RomError::from_body(&[0, 0]), RomError::Success);
        assert_eq!(
            RomError::from_body(&[1, 0x05]),
            RomError::Failed {
                status: 1,
                error: 0x05
            }
        );
        assert_eq!(RomError::from_body(&[0]), RomError::Missing);
    }
}
