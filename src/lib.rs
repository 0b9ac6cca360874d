// src/lib.rs
//
// Capture buffer registry, CSV ingestion, serial framing and buffer queries.
// `buffers` and `framing` hold the command surface; the rest is the engine.

pub mod buffer_db;
pub mod buffer_query;
pub mod buffer_store;
pub mod buffers;
pub mod checksums;
pub mod error;
pub mod framing;
pub mod io;
pub mod logging;
pub mod settings;

pub use buffer_query::{BufferPage, TailResponse};
pub use buffer_store::{
    BufferFrameInfo, BufferItems, BufferKind, BufferMetadata, BufferRegistry, OrphanedBufferInfo, TimestampedByte,
};
pub use error::{BufferError, Result};
pub use framing::{
    apply_framing, frame_bytes, BackendFramingConfig, FramedStream, FramingConfig, FramingHandle, FramingModeConfig,
    FramingResult,
};
pub use io::serial::{ByteIndexConfig, FramingMode};
pub use io::{FrameMessage, TaskControl, TaskHandle};
pub use settings::StoreSettings;
