//! Sentinel protocol layer
//!
//! # Components
//! - `bashrc`: the in-band marker definitions and the shell hook that emits them
//! - `ByteCoalescer`: buffers raw serial bytes into display-granular chunks
//! - `SentinelParser`: splits chunks into display segments and command events

mod bashrc;
mod coalescer;
mod parser;

pub use bashrc::{generate_bashrc, BLOCKED_COMMANDS, CMD_END, CMD_START, SENTINEL_BYTE};
pub use coalescer::ByteCoalescer;
pub use parser::{CommandResult, ParserFlush, SentinelParser};
