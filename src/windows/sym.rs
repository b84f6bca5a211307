//! DbgHelp-backed implementations of the symbol-resolution and stack-walk
//! seams. One `DbgHelpSession` wraps `SymInitializeW`/`SymCleanup` around a
//! process handle; walkers borrow the session so cleanup cannot race a
//! walk.

use std::ffi::c_void;

use windows_sys::Win32::Foundation::HANDLE;
use windows_sys::Win32::System::Diagnostics::Debug::{
    StackWalk64, SymCleanup, SymFromAddrW, SymFunctionTableAccess64, SymGetLineFromAddrW64,
    SymGetModuleBase64, SymInitializeW, SymSetOptions, AddrModeFlat, IMAGEHLP_LINEW64,
    STACKFRAME64, SYMBOL_INFOW, SYMOPT_ALLOW_ABSOLUTE_SYMBOLS, SYMOPT_DEFERRED_LOADS,
    SYMOPT_INCLUDE_32BIT_MODULES, SYMOPT_LOAD_LINES, SYMOPT_UNDNAME,
};

use crate::debug_context::{DebugContext, ThreadContext, ThreadContextX64, ThreadContextX86};
use crate::strings;
use crate::symbols::{FrameWalker, RawFrame, ResolvedLine, ResolvedSymbol, SymbolResolver};

const MAX_SYM_NAME: usize = 2000;
const IMAGE_FILE_MACHINE_I386: u32 = 0x014C;
const IMAGE_FILE_MACHINE_AMD64: u32 = 0x8664;

/// A DbgHelp symbol session for one process. PDBs are searched in the
/// given directories (joined with `';'`) on top of the default paths.
pub struct DbgHelpSession {
    process: HANDLE,
}

impl DbgHelpSession {
    pub fn initialize(process: HANDLE, search_paths: &[String]) -> Self {
        // SAFETY: syscall
        unsafe {
            SymSetOptions(
                SYMOPT_ALLOW_ABSOLUTE_SYMBOLS
                    | SYMOPT_DEFERRED_LOADS
                    | SYMOPT_INCLUDE_32BIT_MODULES
                    | SYMOPT_LOAD_LINES
                    | SYMOPT_UNDNAME,
            );
        }

        let joined = search_paths.join(";");
        let search_path_w = if joined.is_empty() {
            None
        } else {
            let mut units = strings::to_utf16(&joined);
            units.push(0);
            Some(units)
        };

        // SAFETY: syscall; the search path buffer outlives the call.
        unsafe {
            SymInitializeW(
                process,
                search_path_w
                    .as_ref()
                    .map_or(std::ptr::null(), |units| units.as_ptr()),
                1,
            );
        }

        DbgHelpSession { process }
    }
}

impl Drop for DbgHelpSession {
    fn drop(&mut self) {
        // SAFETY: syscall; paired with SymInitializeW above.
        unsafe { SymCleanup(self.process) };
    }
}

impl SymbolResolver for DbgHelpSession {
    fn symbol_at(&mut self, address: u64) -> Option<ResolvedSymbol> {
        // SYMBOL_INFOW is followed by an inline name buffer; a u64 backing
        // store keeps the struct aligned.
        let words = (std::mem::size_of::<SYMBOL_INFOW>() + MAX_SYM_NAME * 2).div_ceil(8);
        let mut buffer = vec![0u64; words];
        let symbol = buffer.as_mut_ptr().cast::<SYMBOL_INFOW>();
        // SAFETY: the buffer is large enough for the struct header and the
        // name area announced through MaxNameLen.
        unsafe {
            (*symbol).SizeOfStruct = std::mem::size_of::<SYMBOL_INFOW>() as u32;
            (*symbol).MaxNameLen = MAX_SYM_NAME as u32;
        }

        let mut displacement = 0u64;
        // SAFETY: syscall
        let ok = unsafe { SymFromAddrW(self.process, address, &mut displacement, symbol) };
        if ok == 0 {
            return None;
        }

        // SAFETY: on success DbgHelp filled the header and NameLen UTF-16
        // units of the trailing name buffer.
        let resolved = unsafe {
            let name_len = (*symbol).NameLen as usize;
            let name_ptr = std::ptr::addr_of!((*symbol).Name).cast::<u16>();
            let units: Vec<u16> = (0..name_len).map(|i| name_ptr.add(i).read_unaligned()).collect();
            ResolvedSymbol {
                name: strings::from_utf16(&units),
                address: (*symbol).Address,
                displacement,
                module_base: (*symbol).ModBase,
                size: u64::from((*symbol).Size),
            }
        };
        Some(resolved)
    }

    fn line_at(&mut self, address: u64) -> Option<ResolvedLine> {
        // SAFETY: zero is valid for every field; SizeOfStruct set below.
        let mut line: IMAGEHLP_LINEW64 = unsafe { std::mem::zeroed() };
        line.SizeOfStruct = std::mem::size_of::<IMAGEHLP_LINEW64>() as u32;

        let mut displacement = 0u32;
        // SAFETY: syscall
        let ok = unsafe { SymGetLineFromAddrW64(self.process, address, &mut displacement, &mut line) };
        if ok == 0 {
            return None;
        }

        // SAFETY: FileName points at a NUL-terminated string owned by
        // DbgHelp, valid until the next line query.
        let file = unsafe { read_wide_z(line.FileName) };
        Some(ResolvedLine {
            file,
            line: line.LineNumber,
            line_address: line.Address,
            displacement: u64::from(displacement),
        })
    }
}

/// `StackWalk64` mutates the register file as it unwinds, so the walker
/// owns a private copy of the context.
enum WalkContext {
    X64(Box<ThreadContextX64>),
    X86(Box<ThreadContextX86>),
}

/// A `StackWalk64` driver. A [`DbgHelpSession`] for the same process must
/// be alive for the duration of the walk; the walker itself only needs the
/// raw handles.
pub struct DbgHelpWalker {
    process: HANDLE,
    thread: HANDLE,
    machine: u32,
    frame: STACKFRAME64,
    context: WalkContext,
}

impl DbgHelpWalker {
    /// Seed a walk with the program counter, frame pointer and stack
    /// pointer of the captured context.
    pub fn new(process: HANDLE, thread: HANDLE, context: &DebugContext) -> Self {
        // SAFETY: all-zero STACKFRAME64 is the documented starting state.
        let mut frame: STACKFRAME64 = unsafe { std::mem::zeroed() };
        frame.AddrPC.Offset = context.program_counter();
        frame.AddrPC.Mode = AddrModeFlat;
        frame.AddrFrame.Offset = context.frame_pointer();
        frame.AddrFrame.Mode = AddrModeFlat;
        frame.AddrStack.Offset = context.stack_pointer();
        frame.AddrStack.Mode = AddrModeFlat;

        let (machine, walk_context) = match context.registers() {
            ThreadContext::X64(registers) => {
                (IMAGE_FILE_MACHINE_AMD64, WalkContext::X64(Box::new(*registers)))
            }
            ThreadContext::X86(registers) => {
                (IMAGE_FILE_MACHINE_I386, WalkContext::X86(Box::new(*registers)))
            }
        };

        DbgHelpWalker {
            process,
            thread,
            machine,
            frame,
            context: walk_context,
        }
    }
}

impl FrameWalker for DbgHelpWalker {
    fn next_frame(&mut self) -> Option<RawFrame> {
        let context_ptr: *mut c_void = match &mut self.context {
            WalkContext::X64(registers) => (registers.as_mut() as *mut ThreadContextX64).cast(),
            WalkContext::X86(registers) => (registers.as_mut() as *mut ThreadContextX86).cast(),
        };

        // SAFETY: syscall; the frame and context outlive the call and the
        // routine pointers are the DbgHelp defaults for this use.
        let ok = unsafe {
            StackWalk64(
                self.machine,
                self.process,
                self.thread,
                &mut self.frame,
                context_ptr,
                None,
                Some(SymFunctionTableAccess64),
                Some(SymGetModuleBase64),
                None,
            )
        };
        if ok == 0 {
            return None;
        }

        Some(RawFrame {
            program_counter: self.frame.AddrPC.Offset,
            return_address: self.frame.AddrReturn.Offset,
            frame_pointer: self.frame.AddrFrame.Offset,
            stack_pointer: self.frame.AddrStack.Offset,
        })
    }
}

/// Read a NUL-terminated UTF-16 string from a raw pointer.
///
/// # Safety
/// `pointer` must be null or point at a NUL-terminated UTF-16 buffer.
unsafe fn read_wide_z(pointer: *const u16) -> String {
    if pointer.is_null() {
        return String::new();
    }
    let mut units = Vec::new();
    let mut cursor = pointer;
    loop {
        let unit = cursor.read_unaligned();
        if unit == 0 {
            break;
        }
        units.push(unit);
        cursor = cursor.add(1);
    }
    strings::from_utf16(&units)
}
