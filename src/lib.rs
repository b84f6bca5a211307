//! A Windows crash snapshot engine: attach to a debuggee live or take a
//! JIT crash handoff, normalize the debug-event stream, enrich exceptions
//! with stack traces and MSVC RTTI, and fan everything out to event sinks.
//! The binary-log sink produces a CRC-sealed file the replayer turns back
//! into the identical sink-call sequence, with no debuggee required.

pub mod binary_log;
pub mod crc32;
pub mod debug_context;
pub mod errors;
pub mod event;
pub mod memory;
pub mod module_collection;
pub mod path_util;
pub mod rtti;
pub mod sink;
pub mod stack_trace;
pub mod strings;
pub mod symbols;
pub mod text_log;

cfg_if::cfg_if! {
    if #[cfg(target_os = "windows")] {
        pub mod windows;

        pub use windows::{Debugger, DebuggerOptions, TargetProcess};
    }
}

pub use binary_log::{BinaryLogPlayer, BinaryLogWriter, EventFilter, PlayerOptions};
pub use debug_context::{DebugContext, ThreadContextX64, ThreadContextX86};
pub use errors::{PlayerError, RemoteReadError, SessionError};
pub use event::{ExceptionEvent, ProcessInfo, ProcessView};
pub use module_collection::{Module, ModuleCollection};
pub use rtti::ExceptionRtti;
pub use sink::EventSink;
pub use stack_trace::{DecodedInstruction, StackFrameEntry, StackTrace};
pub use text_log::TextualSink;
