//! scibridge: drives an external image I/O worker over stdin/stdout/stderr.

pub mod bridge;
pub mod config;
pub mod error;
pub mod image;
pub mod metadata;
pub mod mux;
mod session;
pub mod supervisor;
mod transfer;

#[cfg(test)]
mod testing;

pub use config::{BridgeConfig, LineEnding, WorkerCommand};
pub use error::{BridgeError, ConfigError, MetadataError, SpawnError};
pub use image::{ByteOrder, ComponentType, ImageInfo, IoRegion, LookupTable, PixelType};
pub use metadata::MetadataDictionary;
pub use session::Bridge;
pub use supervisor::WorkerState;
pub use transfer::{TransferStats, region_len};
