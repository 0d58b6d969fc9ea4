//! Error types for the NMEA bridge.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serial: {0}")]
    Serial(#[from] nix::Error),

    #[error("Config: {0}")]
    Config(String),

    #[error("Bus: {0}")]
    Bus(String),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
