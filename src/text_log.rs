//! The reference textual sink: renders every event for human reading. Its
//! output is fully determined by the event stream, so replaying a binary
//! log through it reproduces the live session's text log.

use std::io::Write;

use chrono::{Local, TimeZone};

use crate::debug_context::{DebugContext, ThreadContext};
use crate::event::{ExceptionEvent, ProcessInfo, ProcessView, RipInfo};
use crate::module_collection::ModuleCollection;
use crate::rtti::ExceptionRtti;
use crate::sink::EventSink;
use crate::stack_trace::StackTrace;

const SLE_ERROR: u32 = 1;
const SLE_MINORERROR: u32 = 2;
const SLE_WARNING: u32 = 3;

pub struct TextualSink<W: Write> {
    out: W,
    timestamps: bool,
    print_context: bool,
}

impl<W: Write> TextualSink<W> {
    pub fn new(out: W, timestamps: bool, print_context: bool) -> Self {
        TextualSink {
            out,
            timestamps,
            print_context,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    /// Sinks are total: a failed write drops the line, not the session.
    fn emit(&mut self, text: &str) {
        let _ = self.out.write_all(text.as_bytes());
    }

    fn timestamp(&mut self, time: i64) {
        if !self.timestamps {
            return;
        }
        if let Some(stamp) = Local.timestamp_opt(time, 0).single() {
            self.emit(&format!("({}) ", stamp.format("%d/%m/%Y %H:%M:%S")));
        }
    }

    fn address_descriptor(address: u64, modules: &ModuleCollection) -> String {
        match modules.module_at_address(address) {
            Some(module) => format!(" @ {}+0x{:x}", module.path, address - module.base),
            None => format!(" @ 0x{address:x}"),
        }
    }

    fn print_rtti(&mut self, rtti: &ExceptionRtti) {
        self.emit("[RTTI]\n");
        let count = rtti.type_names.len();
        for (i, name) in rtti.type_names.iter().enumerate() {
            let tail = if i + 1 != count { " extends: " } else { "." };
            self.emit(&format!("\t{name}{tail}\n"));
        }
        if let Some(path) = &rtti.throw_image_path {
            self.emit(&format!("\tthrow info source(): {path}\n"));
        }
        if let Some(message) = &rtti.message {
            self.emit(&format!("\twhat(): {message}\n"));
        }
    }

    fn print_registers(&mut self, context: &DebugContext) {
        self.emit("[CPUCTX]\n");

        let (registers, width): (Vec<(&str, u64)>, usize) = match context.registers() {
            ThreadContext::X64(c) => (
                vec![
                    ("RIP", c.rip),
                    ("RSP", c.rsp),
                    ("RBP", c.rbp),
                    ("RAX", c.rax),
                    ("RBX", c.rbx),
                    ("RCX", c.rcx),
                    ("RDX", c.rdx),
                    ("RSI", c.rsi),
                    ("RDI", c.rdi),
                    ("R8", c.r8),
                    ("R9", c.r9),
                    ("R10", c.r10),
                    ("R11", c.r11),
                    ("R12", c.r12),
                    ("R13", c.r13),
                    ("R14", c.r14),
                    ("R15", c.r15),
                ],
                16,
            ),
            ThreadContext::X86(c) => (
                vec![
                    ("EIP", u64::from(c.eip)),
                    ("ESP", u64::from(c.esp)),
                    ("EBP", u64::from(c.ebp)),
                    ("EAX", u64::from(c.eax)),
                    ("EBX", u64::from(c.ebx)),
                    ("ECX", u64::from(c.ecx)),
                    ("EDX", u64::from(c.edx)),
                    ("ESI", u64::from(c.esi)),
                    ("EDI", u64::from(c.edi)),
                ],
                8,
            ),
        };

        self.emit("\t");
        let count = registers.len();
        let mut in_line = 0;
        for (current, (name, value)) in registers.into_iter().enumerate() {
            self.emit(&format!("{name:>3} = {value:0width$x}"));
            if in_line == 2 || current == count - 1 {
                self.emit("\n");
                in_line = 0;
                if current != count - 1 {
                    self.emit("\t");
                }
            } else {
                self.emit("  ");
                in_line += 1;
            }
        }
        self.emit("\n");
    }

    fn print_stack_trace(&mut self, trace: &StackTrace, modules: &ModuleCollection) {
        if trace.is_empty() {
            self.emit("no stack trace available\n");
            return;
        }

        self.emit("[STACK]\n");
        let mut frame_index: u64 = 0;
        for frame in trace.entries() {
            if frame.recursion {
                self.emit(&format!(
                    "\t... recursion {} frames ...\n",
                    frame.recursion_count
                ));
                frame_index += frame.recursion_count;
                continue;
            }

            let label = format!("#{frame_index}: ");
            let name = if frame.name.is_empty() {
                "<unknown>"
            } else {
                frame.name.as_str()
            };
            self.emit(&format!(
                "\t{label}{name}{}\n",
                Self::address_descriptor(frame.address, modules)
            ));

            let pad = " ".repeat(label.len());
            for instruction in &frame.instructions {
                let width = if instruction.is_64bit { 16 } else { 8 };
                let mut line = format!(
                    "\t{pad}{offset:0width$x} ({size:02}) {hex:<24} {mnemonic}",
                    offset = instruction.offset,
                    size = instruction.size,
                    hex = instruction.hex,
                    mnemonic = instruction.mnemonic,
                );
                if !instruction.operands.is_empty() {
                    line.push(' ');
                    line.push_str(&instruction.operands);
                }
                line.push('\n');
                self.emit(&line);
            }

            if !frame.file.is_empty() {
                self.emit(&format!("\t{pad}{}: line {}\n", frame.file, frame.line));
            }

            frame_index += 1;
        }
    }
}

impl<W: Write> EventSink for TextualSink<W> {
    fn on_initialization(&mut self, time: i64, process: &ProcessView) {
        self.timestamp(time);
        self.emit(&format!("Attached to process 0x{:x}\n", process.process_id));
        self.emit(&format!("{:<12}{}\n", "Path: ", process.path));
        self.emit(&format!("{:<12}{}\n", "WorkDir: ", process.working_directory));
        if process.arguments.is_empty() {
            self.emit(&format!("{:<12}\n", "Arguments: "));
        } else {
            self.emit(&format!(
                "{:<12}\"{}\"\n",
                "Arguments: ",
                process.arguments.join("\" \"")
            ));
        }
    }

    fn on_breakpoint_hit(
        &mut self,
        time: i64,
        event: &ExceptionEvent,
        _pi: &ProcessInfo,
        context: &DebugContext,
        trace: &StackTrace,
        modules: &ModuleCollection,
    ) {
        self.timestamp(time);
        self.emit(&format!(
            "[BREAK] (0x{:x}){}\n",
            event.code,
            Self::address_descriptor(event.address, modules)
        ));
        if self.print_context {
            self.print_registers(context);
        }
        self.print_stack_trace(trace, modules);
    }

    fn on_exception(
        &mut self,
        time: i64,
        event: &ExceptionEvent,
        _pi: &ProcessInfo,
        name: &str,
        context: &DebugContext,
        trace: &StackTrace,
        modules: &ModuleCollection,
    ) {
        self.timestamp(time);
        let mut line = format!(
            "[EXCEPT] (0x{:x}){}",
            event.code,
            Self::address_descriptor(event.address, modules)
        );
        if event.first_chance {
            line.push_str(", first chance");
        }
        if !name.is_empty() {
            line.push_str(": ");
            line.push_str(name);
        }
        line.push('\n');
        self.emit(&line);

        if let Some(rtti) = &event.rtti {
            self.print_rtti(rtti);
        }
        if self.print_context {
            self.print_registers(context);
        }
        self.print_stack_trace(trace, modules);
    }

    fn on_create_process(
        &mut self,
        time: i64,
        _image_base: u64,
        pi: &ProcessInfo,
        path: &str,
        _modules: &ModuleCollection,
    ) {
        self.timestamp(time);
        self.emit(&format!("[CREATE PROCESS] 0x{:x} {path}\n", pi.process_id));
    }

    fn on_create_thread(
        &mut self,
        time: i64,
        entry_point: u64,
        pi: &ProcessInfo,
        modules: &ModuleCollection,
    ) {
        self.timestamp(time);
        self.emit(&format!(
            "[CREATE THREAD] 0x{:x}{}\n",
            pi.thread_id,
            Self::address_descriptor(entry_point, modules)
        ));
    }

    fn on_exit_process(
        &mut self,
        time: i64,
        exit_code: u32,
        pi: &ProcessInfo,
        _modules: &ModuleCollection,
    ) {
        self.timestamp(time);
        self.emit(&format!(
            "[EXIT PROCESS] 0x{:x}, exit code 0x{exit_code:x}\n",
            pi.process_id
        ));
    }

    fn on_exit_thread(
        &mut self,
        time: i64,
        exit_code: u32,
        pi: &ProcessInfo,
        _modules: &ModuleCollection,
    ) {
        self.timestamp(time);
        self.emit(&format!(
            "[EXIT THREAD] 0x{:x}, exit code 0x{exit_code:x}\n",
            pi.thread_id
        ));
    }

    fn on_dll_load(
        &mut self,
        time: i64,
        base: u64,
        _pi: &ProcessInfo,
        path: &str,
        _module_index: i64,
        _modules: &ModuleCollection,
    ) {
        self.timestamp(time);
        self.emit(&format!("[DLL LOAD] 0x{base:x}: {path}\n"));
    }

    fn on_debug_string(&mut self, time: i64, _pi: &ProcessInfo, message: &str) {
        self.timestamp(time);
        self.emit(&format!("[DEBUGA] {message}"));
        if !message.ends_with('\n') {
            self.emit("\n");
        }
    }

    fn on_debug_string_wide(&mut self, time: i64, _pi: &ProcessInfo, message: &str) {
        self.timestamp(time);
        self.emit(&format!("[DEBUGW] {message}"));
        if !message.ends_with('\n') {
            self.emit("\n");
        }
    }

    fn on_rip(&mut self, time: i64, info: &RipInfo, _pi: &ProcessInfo, error_message: &str) {
        self.timestamp(time);
        let severity = match info.kind {
            SLE_ERROR => "(SLE_ERROR, program fail) ",
            SLE_MINORERROR => "(SLE_MINORERROR, might fail) ",
            SLE_WARNING => "(SLE_WARNING, will not fail) ",
            _ => "",
        };
        self.emit(&format!("[RIP] {severity}{error_message}"));
        if !error_message.ends_with('\n') {
            self.emit("\n");
        }
    }

    fn on_dll_unload(
        &mut self,
        time: i64,
        base: u64,
        _pi: &ProcessInfo,
        path: &str,
        _module_index: i64,
        _modules: &ModuleCollection,
    ) {
        self.timestamp(time);
        self.emit(&format!("[DLL UNLOAD] 0x{base:x}: {path}\n"));
    }

    fn on_module_collection_complete(&mut self, _time: i64, _modules: &ModuleCollection) {
        let _ = self.out.flush();
    }
}
