//! NDJSON parser for Claude Code stream-json protocol.
//!
//! Parses newline-delimited JSON from the CLI's stdout into canonical message
//! types, implementing a tolerant reader pattern.

mod parser;
mod types;

pub use parser::{parse_line, parse_value};
pub use types::*;
