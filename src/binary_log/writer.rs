//! The binary log writer: an [`EventSink`] that streams every event into a
//! length-framed file and maintains a rolling CRC-32 over everything after
//! the file header. The header is rewritten with the final checksum when
//! the session completes; a file whose header CRC is still zero was never
//! finalized.

use std::fs::File;
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

use log::warn;

use crate::binary_log::format::{self, *};
use crate::crc32;
use crate::debug_context::DebugContext;
use crate::event::{self, ExceptionEvent, ProcessInfo, ProcessView, RipInfo};
use crate::module_collection::ModuleCollection;
use crate::rtti::ExceptionRtti;
use crate::sink::EventSink;
use crate::stack_trace::StackTrace;
use crate::strings;

impl From<ProcessInfo> for EventProcessInfo {
    fn from(pi: ProcessInfo) -> Self {
        EventProcessInfo {
            process_handle: pi.process_handle,
            thread_handle: pi.thread_handle,
            process_id: pi.process_id,
            thread_id: pi.thread_id,
        }
    }
}

/// Raw byte view of a packed record.
fn as_bytes<T: plain::Plain>(value: &T) -> &[u8] {
    // SAFETY: `Plain` records are plain data with packed layouts; viewing
    // them as bytes observes no padding or invalid state.
    unsafe { std::slice::from_raw_parts((value as *const T).cast::<u8>(), std::mem::size_of::<T>()) }
}

pub struct BinaryLogWriter<W: Write + Seek> {
    out: W,
    header: FileHeader,
    crc: u32,
    /// First write failure; later events are dropped instead of cancelling
    /// the session.
    io_error: Option<io::Error>,
}

impl BinaryLogWriter<BufWriter<File>> {
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(BinaryLogWriter::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write + Seek> BinaryLogWriter<W> {
    pub fn new(out: W) -> Self {
        BinaryLogWriter {
            out,
            header: FileHeader {
                signature: FILE_SIGNATURE,
                version: format::version_word(),
                process_id: 0,
                thread_id: 0,
                path_length: 0,
                working_directory_length: 0,
                argument_count: 0,
                start_time: 0,
                crc32: 0,
            },
            crc: 0,
            io_error: None,
        }
    }

    /// The first write failure, if any event was lost.
    pub fn io_error(&self) -> Option<&io::Error> {
        self.io_error.as_ref()
    }

    pub fn into_inner(self) -> Result<W, io::Error> {
        match self.io_error {
            Some(error) => Err(error),
            None => Ok(self.out),
        }
    }

    fn write_bytes(&mut self, bytes: &[u8], checksummed: bool) {
        if self.io_error.is_some() {
            return;
        }
        if let Err(error) = self.out.write_all(bytes) {
            warn!("binary log write failed, dropping further events: {error}");
            self.io_error = Some(error);
            return;
        }
        if checksummed {
            self.crc = crc32::update(self.crc, bytes);
        }
    }

    fn write_record<T: plain::Plain>(&mut self, record: &T) {
        self.write_bytes(as_bytes(record), true);
    }

    fn write_ansi(&mut self, text: &str) {
        self.write_bytes(text.as_bytes(), true);
    }

    fn write_wide(&mut self, text: &str) {
        let bytes: Vec<u8> = strings::to_utf16(text)
            .into_iter()
            .flat_map(u16::to_le_bytes)
            .collect();
        self.write_bytes(&bytes, true);
    }

    fn write_context(&mut self, context: &DebugContext) {
        match context.registers() {
            crate::debug_context::ThreadContext::X64(registers) => self.write_record(registers),
            crate::debug_context::ThreadContext::X86(registers) => self.write_record(registers),
        }
    }

    fn write_trace(&mut self, trace: &StackTrace, modules: &ModuleCollection) {
        self.write_record(&TraceHeader {
            signature: TRACE_SIGNATURE,
            max_recursion: trace.max_recursion(),
            max_instructions: trace.max_instructions(),
            entry_count: trace.len() as u64,
        });

        for entry in trace.entries() {
            let module_index = entry
                .module
                .as_ref()
                .filter(|module| module.base != 0 && !module.path.is_empty())
                .map(|module| modules.index_of_path(&module.path))
                .unwrap_or(0);
            self.write_record(&TraceEntryRecord {
                module_index,
                module_base: entry.module_base,
                address: entry.address,
                absolute_address: entry.absolute_address,
                absolute_line_address: entry.absolute_line_address,
                line_address: entry.line_address,
                name_length: entry.name.len() as u64,
                path_length: strings::utf16_len(&entry.file),
                line_number: u64::from(entry.line),
                is_recursion: entry.recursion as u8,
                recursion_count: entry.recursion_count,
                instruction_count: entry.instructions.len() as u64,
            });
            self.write_ansi(&entry.name);
            self.write_wide(&entry.file);

            for instruction in &entry.instructions {
                self.write_record(&TraceInstructionRecord {
                    is_64bit_address: instruction.is_64bit as u8,
                    offset: instruction.offset,
                    size: instruction.size,
                    hex_length: instruction.hex.len() as u64,
                    mnemonic_length: instruction.mnemonic.len() as u64,
                    operands_length: instruction.operands.len() as u64,
                });
                self.write_ansi(&instruction.hex);
                self.write_ansi(&instruction.mnemonic);
                self.write_ansi(&instruction.operands);
            }
        }
    }

    fn write_rtti(&mut self, rtti: &ExceptionRtti) {
        self.write_record(&RttiBlock {
            signature: RTTI_SIGNATURE,
            type_name_count: rtti.type_names.len() as u64,
            message_length: rtti.message.as_deref().map_or(0, |m| m.len() as u64),
            image_path_length: rtti
                .throw_image_path
                .as_deref()
                .map_or(0, strings::utf16_len),
        });
        for name in &rtti.type_names {
            self.write_record(&(name.len() as u64));
            self.write_ansi(name);
        }
        if let Some(message) = &rtti.message {
            self.write_ansi(message);
        }
        if let Some(path) = &rtti.throw_image_path {
            self.write_wide(path);
        }
    }

    /// Breakpoints and exceptions share one on-disk record; only the
    /// `is_breakpoint` byte separates them.
    fn write_exception(
        &mut self,
        time: i64,
        exception: &ExceptionEvent,
        pi: &ProcessInfo,
        context: &DebugContext,
        trace: &StackTrace,
        modules: &ModuleCollection,
        is_breakpoint: bool,
    ) {
        let (module_index, offset_in_module) = match modules.module_at_address(exception.address) {
            Some(module) => (
                modules.index_of_path(&module.path),
                exception.address - module.base,
            ),
            None => (-1, 0),
        };

        self.write_record(&ExceptionEventEntry {
            event: EventEntry::new(
                (*pi).into(),
                event::EVENT_ID_EXCEPTION,
                std::mem::size_of::<ExceptionEventEntry>(),
                time,
            ),
            address: exception.address,
            offset_in_module,
            module_index,
            code: exception.code,
            wow64: !context.is_64() as u8,
            is_breakpoint: is_breakpoint as u8,
            is_first_chance: exception.first_chance as u8,
        });
        self.write_context(context);
        self.write_trace(trace, modules);
        if let Some(rtti) = &exception.rtti {
            self.write_rtti(rtti);
        }
    }
}

impl<W: Write + Seek> EventSink for BinaryLogWriter<W> {
    fn on_initialization(&mut self, time: i64, process: &ProcessView) {
        self.header.process_id = process.process_id;
        self.header.thread_id = process.thread_id;
        self.header.path_length = strings::utf16_len(&process.path);
        self.header.working_directory_length = strings::utf16_len(&process.working_directory);
        self.header.argument_count = process.arguments.len() as u64;
        self.header.start_time = time;
        self.header.crc32 = 0;

        // the header itself stays outside the checksummed region
        let header = self.header;
        self.write_bytes(as_bytes(&header), false);
        self.write_wide(&process.path);
        self.write_wide(&process.working_directory);
        for argument in &process.arguments {
            self.write_record(&(argument.len() as u32));
            self.write_ansi(argument);
        }
    }

    fn on_breakpoint_hit(
        &mut self,
        time: i64,
        event: &ExceptionEvent,
        pi: &ProcessInfo,
        context: &DebugContext,
        trace: &StackTrace,
        modules: &ModuleCollection,
    ) {
        self.write_exception(time, event, pi, context, trace, modules, true);
    }

    fn on_exception(
        &mut self,
        time: i64,
        event: &ExceptionEvent,
        pi: &ProcessInfo,
        _name: &str,
        context: &DebugContext,
        trace: &StackTrace,
        modules: &ModuleCollection,
    ) {
        self.write_exception(time, event, pi, context, trace, modules, false);
    }

    fn on_create_process(
        &mut self,
        time: i64,
        image_base: u64,
        pi: &ProcessInfo,
        path: &str,
        modules: &ModuleCollection,
    ) {
        let (module_base, module_size) = match modules.module_at_address(image_base) {
            Some(module) => (module.base, module.size),
            None => (image_base, 0),
        };
        self.write_record(&CreateProcessEventEntry {
            event: EventEntry::new(
                (*pi).into(),
                event::EVENT_ID_CREATE_PROCESS,
                std::mem::size_of::<CreateProcessEventEntry>(),
                time,
            ),
            path_length: strings::utf16_len(path),
            module_base,
            module_size,
        });
        self.write_wide(path);
    }

    fn on_create_thread(
        &mut self,
        time: i64,
        entry_point: u64,
        pi: &ProcessInfo,
        modules: &ModuleCollection,
    ) {
        let (module_index, entry_point_offset) = match modules.module_at_address(entry_point) {
            Some(module) => (modules.index_of_path(&module.path), entry_point - module.base),
            None => (-1, 0),
        };
        self.write_record(&CreateThreadEventEntry {
            event: EventEntry::new(
                (*pi).into(),
                event::EVENT_ID_CREATE_THREAD,
                std::mem::size_of::<CreateThreadEventEntry>(),
                time,
            ),
            entry_point,
            module_index,
            entry_point_offset,
        });
    }

    fn on_exit_process(
        &mut self,
        time: i64,
        exit_code: u32,
        pi: &ProcessInfo,
        _modules: &ModuleCollection,
    ) {
        self.write_record(&ExitProcessEventEntry {
            event: EventEntry::new(
                (*pi).into(),
                event::EVENT_ID_EXIT_PROCESS,
                std::mem::size_of::<ExitProcessEventEntry>(),
                time,
            ),
            exit_code,
        });
    }

    fn on_exit_thread(
        &mut self,
        time: i64,
        exit_code: u32,
        pi: &ProcessInfo,
        _modules: &ModuleCollection,
    ) {
        self.write_record(&ExitThreadEventEntry {
            event: EventEntry::new(
                (*pi).into(),
                event::EVENT_ID_EXIT_THREAD,
                std::mem::size_of::<ExitThreadEventEntry>(),
                time,
            ),
            exit_code,
        });
    }

    fn on_dll_load(
        &mut self,
        time: i64,
        base: u64,
        pi: &ProcessInfo,
        path: &str,
        module_index: i64,
        modules: &ModuleCollection,
    ) {
        let module_size = modules
            .module_at_address(base)
            .map(|module| module.size)
            .unwrap_or(0);
        self.write_record(&DllLoadEventEntry {
            event: EventEntry::new(
                (*pi).into(),
                event::EVENT_ID_LOAD_DLL,
                std::mem::size_of::<DllLoadEventEntry>(),
                time,
            ),
            module_index,
            module_base: base,
            module_size,
            path_length: strings::utf16_len(path),
        });
        self.write_wide(path);
    }

    fn on_debug_string(&mut self, time: i64, pi: &ProcessInfo, message: &str) {
        self.write_record(&DebugStringEventEntry {
            event: EventEntry::new(
                (*pi).into(),
                event::EVENT_ID_DEBUG_STRING,
                std::mem::size_of::<DebugStringEventEntry>(),
                time,
            ),
            is_unicode: 0,
            length: message.len() as u64,
        });
        self.write_ansi(message);
    }

    fn on_debug_string_wide(&mut self, time: i64, pi: &ProcessInfo, message: &str) {
        self.write_record(&DebugStringEventEntry {
            event: EventEntry::new(
                (*pi).into(),
                event::EVENT_ID_DEBUG_STRING,
                std::mem::size_of::<DebugStringEventEntry>(),
                time,
            ),
            is_unicode: 1,
            length: strings::utf16_len(message),
        });
        self.write_wide(message);
    }

    fn on_rip(&mut self, time: i64, info: &RipInfo, pi: &ProcessInfo, _error_message: &str) {
        self.write_record(&RipEventEntry {
            event: EventEntry::new(
                (*pi).into(),
                event::EVENT_ID_RIP,
                std::mem::size_of::<RipEventEntry>(),
                time,
            ),
            kind: info.kind,
            error: info.error,
        });
    }

    fn on_dll_unload(
        &mut self,
        time: i64,
        base: u64,
        pi: &ProcessInfo,
        _path: &str,
        _module_index: i64,
        _modules: &ModuleCollection,
    ) {
        self.write_record(&DllUnloadEventEntry {
            event: EventEntry::new(
                (*pi).into(),
                event::EVENT_ID_UNLOAD_DLL,
                std::mem::size_of::<DllUnloadEventEntry>(),
                time,
            ),
            module_base: base,
        });
    }

    /// Seal the log: seek back and rewrite the header with the final CRC.
    fn on_module_collection_complete(&mut self, _time: i64, _modules: &ModuleCollection) {
        if self.io_error.is_some() {
            return;
        }
        self.header.crc32 = self.crc;
        let header = self.header;
        let finalize = |out: &mut W| -> io::Result<()> {
            out.seek(SeekFrom::Start(0))?;
            out.write_all(as_bytes(&header))?;
            out.seek(SeekFrom::End(0))?;
            out.flush()
        };
        if let Err(error) = finalize(&mut self.out) {
            warn!("binary log finalization failed: {error}");
            self.io_error = Some(error);
        }
    }
}
