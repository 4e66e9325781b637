//! MMAP Stream Library
//!
//! Server-side controller for exclusive-mode MMAP low-latency audio streams.

pub mod audio;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod hal;
pub mod service;
pub mod shm;
pub mod stream;

pub use config::{StandbyStopPolicy, StreamConfig};
pub use error::{HalError, StreamError};
pub use service::{StreamHandle, StreamService};
pub use stream::{MmapStream, ServiceStream, StreamState};
