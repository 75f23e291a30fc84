mod connection;
mod config;
mod error;
mod flasher;

pub mod chip;
pub mod elf;
pub mod image;
pub mod lfs;
pub mod slip;
pub mod transport;

pub use config::Config;
pub use connection::{Connection, Response, DEFAULT_BAUDRATE, DEFAULT_TIMEOUT};
pub use error::{DownloadStage, Error, Result, RomError};
pub use flasher::{Flasher, RetryPolicy, SessionState};
