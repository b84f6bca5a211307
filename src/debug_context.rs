//! Register snapshots of a suspended debuggee thread. The 32/64 split is
//! decided once, at capture time, from the process's Wow64 bit; everything
//! downstream carries the tag.
//!
//! The register files mirror the Windows `WOW64_CONTEXT` and x64 `CONTEXT`
//! layouts byte for byte, which is what lands in binary logs.

const WOW64_SIZE_OF_80387_REGISTERS: usize = 80;
const WOW64_MAXIMUM_SUPPORTED_EXTENSION: usize = 512;

/// Legacy x87 state inside the 32-bit context.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct FloatingSaveArea32 {
    pub control_word: u32,
    pub status_word: u32,
    pub tag_word: u32,
    pub error_offset: u32,
    pub error_selector: u32,
    pub data_offset: u32,
    pub data_selector: u32,
    pub register_area: [u8; WOW64_SIZE_OF_80387_REGISTERS],
    pub cr0_npx_state: u32,
}

/// The register file of a Wow64 (32-bit) thread.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ThreadContextX86 {
    pub context_flags: u32,
    pub dr0: u32,
    pub dr1: u32,
    pub dr2: u32,
    pub dr3: u32,
    pub dr6: u32,
    pub dr7: u32,
    pub float_save: FloatingSaveArea32,
    pub seg_gs: u32,
    pub seg_fs: u32,
    pub seg_es: u32,
    pub seg_ds: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub ebp: u32,
    pub eip: u32,
    pub seg_cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub seg_ss: u32,
    pub extended_registers: [u8; WOW64_MAXIMUM_SUPPORTED_EXTENSION],
}

/// The register file of a native 64-bit thread, with the XSAVE legacy area
/// laid out inline.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ThreadContextX64 {
    pub p1_home: u64,
    pub p2_home: u64,
    pub p3_home: u64,
    pub p4_home: u64,
    pub p5_home: u64,
    pub p6_home: u64,
    pub context_flags: u32,
    pub mxcsr: u32,
    pub seg_cs: u16,
    pub seg_ds: u16,
    pub seg_es: u16,
    pub seg_fs: u16,
    pub seg_gs: u16,
    pub seg_ss: u16,
    pub eflags: u32,
    pub dr0: u64,
    pub dr1: u64,
    pub dr2: u64,
    pub dr3: u64,
    pub dr6: u64,
    pub dr7: u64,
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub fp_control_word: u16,
    pub fp_status_word: u16,
    pub fp_tag_word: u8,
    pub fp_reserved1: u8,
    pub fp_error_opcode: u16,
    pub fp_error_offset: u32,
    pub fp_error_selector: u16,
    pub fp_reserved2: u16,
    pub fp_data_offset: u32,
    pub fp_data_selector: u16,
    pub fp_reserved3: u16,
    pub fp_mxcsr: u32,
    pub fp_mxcsr_mask: u32,
    pub float_registers: [u128; 8],
    pub xmm_registers: [u128; 16],
    pub fp_reserved4: [u8; 96],
    pub vector_registers: [u128; 26],
    pub vector_control: u64,
    pub debug_control: u64,
    pub last_branch_to_rip: u64,
    pub last_branch_from_rip: u64,
    pub last_exception_to_rip: u64,
    pub last_exception_from_rip: u64,
}

// SAFETY: plain register files, every bit pattern is a valid value.
unsafe impl plain::Plain for FloatingSaveArea32 {}
// SAFETY: as above.
unsafe impl plain::Plain for ThreadContextX86 {}
// SAFETY: as above.
unsafe impl plain::Plain for ThreadContextX64 {}

// Layout checks against the Windows context sizes serialized in logs.
const _: () = assert!(std::mem::size_of::<ThreadContextX86>() == 716);
const _: () = assert!(std::mem::size_of::<ThreadContextX64>() == 1232);

impl Default for ThreadContextX86 {
    fn default() -> Self {
        // SAFETY: all-zero is a valid register file.
        unsafe { std::mem::zeroed() }
    }
}

impl Default for ThreadContextX64 {
    fn default() -> Self {
        // SAFETY: all-zero is a valid register file.
        unsafe { std::mem::zeroed() }
    }
}

/// The 32/64 tag plus the captured registers.
#[derive(Debug, Clone)]
pub enum ThreadContext {
    X86(ThreadContextX86),
    X64(ThreadContextX64),
}

/// A thread context bound to the process and thread it was captured from.
/// The handles are opaque to the core; they are only echoed into the event
/// stream and closed by whoever opened them.
#[derive(Debug, Clone)]
pub struct DebugContext {
    pub process_handle: u64,
    pub thread_handle: u64,
    context: ThreadContext,
}

impl DebugContext {
    pub fn from_x64(process_handle: u64, thread_handle: u64, context: ThreadContextX64) -> Self {
        DebugContext {
            process_handle,
            thread_handle,
            context: ThreadContext::X64(context),
        }
    }

    pub fn from_x86(process_handle: u64, thread_handle: u64, context: ThreadContextX86) -> Self {
        DebugContext {
            process_handle,
            thread_handle,
            context: ThreadContext::X86(context),
        }
    }

    /// Whether the owning process runs natively 64-bit. This mirrors the
    /// process's Wow64 bit, not any per-thread property.
    pub fn is_64(&self) -> bool {
        matches!(self.context, ThreadContext::X64(_))
    }

    pub fn registers(&self) -> &ThreadContext {
        &self.context
    }

    pub fn x64(&self) -> Option<&ThreadContextX64> {
        match &self.context {
            ThreadContext::X64(context) => Some(context),
            ThreadContext::X86(_) => None,
        }
    }

    pub fn x86(&self) -> Option<&ThreadContextX86> {
        match &self.context {
            ThreadContext::X86(context) => Some(context),
            ThreadContext::X64(_) => None,
        }
    }

    pub fn program_counter(&self) -> u64 {
        match &self.context {
            ThreadContext::X64(context) => context.rip,
            ThreadContext::X86(context) => u64::from(context.eip),
        }
    }

    pub fn frame_pointer(&self) -> u64 {
        match &self.context {
            ThreadContext::X64(context) => context.rbp,
            ThreadContext::X86(context) => u64::from(context.ebp),
        }
    }

    pub fn stack_pointer(&self) -> u64 {
        match &self.context {
            ThreadContext::X64(context) => context.rsp,
            ThreadContext::X86(context) => u64::from(context.esp),
        }
    }
}
