//! The Windows-only half of the crate: the target-process facade over the
//! Win32 debug APIs, the debug-event pump, and the DbgHelp/capstone
//! implementations of the symbol and disassembly seams.

mod debugger;
mod disasm;
mod process;
mod sym;

pub use debugger::{Debugger, DebuggerOptions};
pub use disasm::CapstoneDecoder;
pub use process::{RemoteMemory, TargetProcess};
pub use sym::{DbgHelpSession, DbgHelpWalker};
