// Fortune Uploader - pick a photo and store it through a ticketed upload protocol

pub mod config;
pub mod types;
pub mod http;
pub mod picker;    // Photo acquisition and resource resolution
pub mod ticket;
pub mod transfer;
pub mod verify;
pub mod finalize;
pub mod pipeline;  // Single-flight orchestrator
pub mod bridge;    // JSON envelope for the web host
pub mod utils;

// Re-exports for convenience
pub use bridge::PhotoBridge;
pub use config::Config;
pub use pipeline::{UploadOptions, UploadPipeline};
pub use types::{SessionContext, StaticSession, UploadOutcome};
