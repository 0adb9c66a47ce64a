//! Kit-wide error type

use thiserror_no_std::Error;

use crate::config::ConfigError;
use crate::link::LinkError;
use crate::link::message::MessageError;
use crate::sensors::SensorError;
use crate::storage::StoreError;

#[derive(Error, Debug)]
pub enum KitError {
    #[error("link error: {0}")]
    Link(#[from] LinkError),
    #[error("message error: {0}")]
    Message(#[from] MessageError),
    #[error("reading store error: {0}")]
    Store(#[from] StoreError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("sensor error: {0}")]
    Sensor(#[from] SensorError),
}
