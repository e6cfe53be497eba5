pub mod config;
pub mod duration;
pub mod image;
pub mod retry;

pub use config::{ConfigError, ConvoyConfig};
pub use duration::parse_duration;
pub use image::{Digest, ImageRef, ImageRefError, version_tag};
pub use retry::RetryPolicy;
