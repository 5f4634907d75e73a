pub mod memory;
pub mod stream;
pub mod types;

pub use memory::MemoryBinlog;
pub use stream::{ReplicationSource, ReplicationStream, StreamConfig, StreamConfigBuilder};
pub use types::*;
