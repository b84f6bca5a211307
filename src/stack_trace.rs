//! Stack traces captured at exception time: frames walked from a thread
//! context, enriched with symbols, source lines and leading instructions,
//! with runs of direct recursion collapsed to a marker.

use crate::debug_context::DebugContext;
use crate::memory::MemoryReader;
use crate::module_collection::{Module, ModuleCollection};
use crate::symbols::{FrameWalker, InstructionDecoder, RawFrame, SymbolResolver};

/// How many bytes to read at a frame's program counter when the symbol
/// size is unknown.
const FALLBACK_CODE_BYTES: u64 = 30;

/// One instruction decoded at a frame's program counter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedInstruction {
    pub is_64bit: bool,
    pub offset: u64,
    pub size: u64,
    pub hex: String,
    pub mnemonic: String,
    pub operands: String,
}

/// One stack frame, or a recursion marker standing in for a collapsed run.
#[derive(Debug, Clone, Default)]
pub struct StackFrameEntry {
    /// The active module owning `address` at capture time, if resolvable.
    pub module: Option<Module>,
    pub module_base: u64,
    pub address: u64,
    /// `address` plus the symbol displacement.
    pub absolute_address: u64,
    pub absolute_line_address: u64,
    pub line_address: u64,
    pub name: String,
    pub file: String,
    pub line: u32,
    pub recursion: bool,
    pub recursion_count: u64,
    pub instructions: Vec<DecodedInstruction>,
}

/// An ordered stack trace, innermost frame first.
#[derive(Debug, Clone, Default)]
pub struct StackTrace {
    max_recursion: u64,
    max_instructions: u64,
    entries: Vec<StackFrameEntry>,
}

impl StackTrace {
    /// Rebuild a trace from previously recorded entries (the replay path).
    pub fn from_entries(
        max_recursion: u64,
        max_instructions: u64,
        entries: Vec<StackFrameEntry>,
    ) -> Self {
        StackTrace {
            max_recursion,
            max_instructions,
            entries,
        }
    }

    /// Walk the stack from `context` and build the enriched trace.
    ///
    /// `max_recursion == 0` means unlimited: direct recursion is never
    /// collapsed. `max_instructions == 0` suppresses disassembly.
    pub fn capture(
        context: &DebugContext,
        modules: &ModuleCollection,
        memory: &dyn MemoryReader,
        walker: &mut dyn FrameWalker,
        symbols: &mut dyn SymbolResolver,
        decoder: &dyn InstructionDecoder,
        max_recursion: u64,
        max_instructions: u64,
    ) -> Self {
        let mut trace = StackTrace {
            max_recursion,
            max_instructions,
            entries: Vec::new(),
        };
        let collapse = max_recursion != 0;
        let mut backlog: Vec<RawFrame> = Vec::new();

        while let Some(frame) = walker.next_frame() {
            if collapse {
                // a frame returning to itself is direct recursion; hold it
                // back until the run ends
                if frame.program_counter == frame.return_address {
                    backlog.push(frame);
                    continue;
                }
                if !backlog.is_empty() {
                    trace.flush_backlog(
                        &mut backlog,
                        context,
                        modules,
                        memory,
                        symbols,
                        decoder,
                    );
                }
            }
            trace.push_frame(&frame, context, modules, memory, symbols, decoder);
        }

        // the walker may end inside a recursive run
        if collapse && !backlog.is_empty() {
            trace.flush_backlog(&mut backlog, context, modules, memory, symbols, decoder);
        }

        trace
    }

    pub fn max_recursion(&self) -> u64 {
        self.max_recursion
    }

    pub fn max_instructions(&self) -> u64 {
        self.max_instructions
    }

    pub fn entries(&self) -> &[StackFrameEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn flush_backlog(
        &mut self,
        backlog: &mut Vec<RawFrame>,
        context: &DebugContext,
        modules: &ModuleCollection,
        memory: &dyn MemoryReader,
        symbols: &mut dyn SymbolResolver,
        decoder: &dyn InstructionDecoder,
    ) {
        let run = std::mem::take(backlog);
        if run.len() as u64 >= self.max_recursion {
            // collapse: one marker, then the last frame of the run
            self.entries.push(StackFrameEntry {
                recursion: true,
                recursion_count: run.len() as u64,
                ..Default::default()
            });
            self.push_frame(&run[run.len() - 1], context, modules, memory, symbols, decoder);
        } else {
            for frame in &run {
                self.push_frame(frame, context, modules, memory, symbols, decoder);
            }
        }
    }

    fn push_frame(
        &mut self,
        frame: &RawFrame,
        context: &DebugContext,
        modules: &ModuleCollection,
        memory: &dyn MemoryReader,
        symbols: &mut dyn SymbolResolver,
        decoder: &dyn InstructionDecoder,
    ) {
        let address = frame.program_counter;
        let mut entry = StackFrameEntry {
            address,
            ..Default::default()
        };
        let mut code_bytes = FALLBACK_CODE_BYTES;

        if let Some(symbol) = symbols.symbol_at(address) {
            match modules.module_at_address(symbol.address) {
                Some(module) => {
                    entry.module_base = if symbol.module_base != 0 {
                        symbol.module_base
                    } else {
                        module.base
                    };
                    entry.module = Some(module.clone());
                }
                None => entry.module_base = symbol.module_base,
            }
            entry.absolute_address = address.wrapping_add(symbol.displacement);
            entry.name = symbol.name;
            if symbol.size != 0 {
                code_bytes = symbol.size;
            }
        }

        if self.max_instructions != 0 {
            entry.instructions =
                disassemble(memory, decoder, address, code_bytes, context.is_64(), self.max_instructions);
        }

        if let Some(line) = symbols.line_at(address) {
            entry.absolute_line_address = address.wrapping_add(line.displacement);
            entry.line_address = line.line_address;
            entry.file = line.file;
            entry.line = line.line;
        }

        self.entries.push(entry);
    }
}

fn disassemble(
    memory: &dyn MemoryReader,
    decoder: &dyn InstructionDecoder,
    address: u64,
    code_bytes: u64,
    is_64bit: bool,
    max_instructions: u64,
) -> Vec<DecodedInstruction> {
    let mut code = vec![0u8; code_bytes as usize];
    match memory.read(address, &mut code) {
        Ok(()) => decoder.decode(&code, address, is_64bit, max_instructions as usize),
        // unreadable code leaves the listing empty, the trace goes on
        Err(_) => Vec::new(),
    }
}
