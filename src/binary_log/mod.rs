//! The replayable binary log: on-disk framing, the writer sink and the
//! player that drives the same sink interface back out of a file.

pub mod format;
pub mod player;
pub mod writer;

pub use player::{BinaryLogPlayer, EventFilter, FilterEvent, PlayerOptions};
pub use writer::BinaryLogWriter;
