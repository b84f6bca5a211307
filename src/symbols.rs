//! Seams to the platform services the stack-trace builder leans on: the
//! native stack walker, the debug-symbol resolver, and the instruction
//! decoder. The Windows implementations wrap DbgHelp and capstone; tests
//! plug in canned doubles.

use crate::stack_trace::DecodedInstruction;

/// One raw frame produced by the platform stack walker.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawFrame {
    pub program_counter: u64,
    pub return_address: u64,
    pub frame_pointer: u64,
    pub stack_pointer: u64,
}

/// Produces successive stack frames from a seeded thread context, innermost
/// first, until the platform can unwind no further.
pub trait FrameWalker {
    fn next_frame(&mut self) -> Option<RawFrame>;
}

/// A symbol resolved at an address.
#[derive(Debug, Clone, Default)]
pub struct ResolvedSymbol {
    pub name: String,
    /// Virtual address the symbol starts at.
    pub address: u64,
    /// Distance from the symbol start to the queried address.
    pub displacement: u64,
    /// Base of the image the symbol came from, 0 when unknown.
    pub module_base: u64,
    /// Size of the symbol in bytes, 0 when unknown.
    pub size: u64,
}

/// A source line resolved at an address.
#[derive(Debug, Clone, Default)]
pub struct ResolvedLine {
    pub file: String,
    pub line: u32,
    /// Address the line starts at.
    pub line_address: u64,
    /// Distance from the line start to the queried address.
    pub displacement: u64,
}

/// Resolves addresses to symbols and source lines, typically out of PDBs.
/// Either lookup may come back empty; frames then carry addresses only.
pub trait SymbolResolver {
    fn symbol_at(&mut self, address: u64) -> Option<ResolvedSymbol>;
    fn line_at(&mut self, address: u64) -> Option<ResolvedLine>;
}

/// Decodes machine code read out of the debuggee. A failed decode returns
/// an empty list, never an error.
pub trait InstructionDecoder {
    fn decode(
        &self,
        code: &[u8],
        address: u64,
        is_64bit: bool,
        max_instructions: usize,
    ) -> Vec<DecodedInstruction>;
}
