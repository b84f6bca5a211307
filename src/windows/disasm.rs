//! Capstone-backed instruction decoding for the per-frame listings.

use capstone::arch::x86::{ArchMode, ArchSyntax};
use capstone::arch::BuildsCapstone;
use capstone::arch::BuildsCapstoneSyntax;
use capstone::Capstone;

use crate::stack_trace::DecodedInstruction;
use crate::symbols::InstructionDecoder;

pub struct CapstoneDecoder;

impl CapstoneDecoder {
    fn engine(is_64bit: bool) -> Option<Capstone> {
        Capstone::new()
            .x86()
            .mode(if is_64bit {
                ArchMode::Mode64
            } else {
                ArchMode::Mode32
            })
            .syntax(ArchSyntax::Intel)
            .build()
            .ok()
    }
}

impl InstructionDecoder for CapstoneDecoder {
    fn decode(
        &self,
        code: &[u8],
        address: u64,
        is_64bit: bool,
        max_instructions: usize,
    ) -> Vec<DecodedInstruction> {
        let Some(engine) = Self::engine(is_64bit) else {
            return Vec::new();
        };
        let Ok(instructions) = engine.disasm_count(code, address, max_instructions) else {
            return Vec::new();
        };

        instructions
            .iter()
            .map(|instruction| {
                let hex: String = instruction
                    .bytes()
                    .iter()
                    .map(|byte| format!("{byte:02x}"))
                    .collect();
                DecodedInstruction {
                    is_64bit,
                    offset: instruction.address(),
                    size: instruction.bytes().len() as u64,
                    hex,
                    mnemonic: instruction.mnemonic().unwrap_or("").to_string(),
                    operands: instruction.op_str().unwrap_or("").to_string(),
                }
            })
            .collect()
    }
}
