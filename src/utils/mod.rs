//! Shared helpers: little-endian byte access and blocking synchronization primitives.

mod io;
mod parser;
pub(crate) mod synchronization;

pub use io::{read_le_at, write_compressed_uint, write_le_at, CodeIO};
pub use parser::Parser;
pub use synchronization::CompletionSemaphore;
