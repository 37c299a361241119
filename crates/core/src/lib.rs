pub mod config;
pub mod error;

pub use config::{BatchConsumerConfig, Config, Environment, InitialOffset, KafkaConfig, LogConfig};
pub use error::ConfigError;
