//! The binary log replayer: reads a recorded session back and reissues the
//! exact sink calls the live writer received, so a textual log rendered
//! from a binary log is bit-identical to one rendered live.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use std::str::FromStr;

use log::debug;

use crate::binary_log::format::{self, *};
use crate::crc32;
use crate::debug_context::{DebugContext, ThreadContextX64, ThreadContextX86};
use crate::errors::PlayerError;
use crate::event::{
    self, exception_name, ExceptionEvent, ProcessInfo, ProcessView, RipInfo,
};
use crate::module_collection::ModuleCollection;
use crate::rtti::ExceptionRtti;
use crate::sink::EventSink;
use crate::stack_trace::{DecodedInstruction, StackFrameEntry, StackTrace};
use crate::strings;

const SANITY_BUFFER_SIZE: usize = 4096;

/// The closed set of event names a replay filter accepts. Breakpoints and
/// exceptions share an on-disk record but filter separately; `Debug`
/// matches both the ANSI and wide string variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterEvent {
    CreateProcess,
    CreateThread,
    ExitProcess,
    ExitThread,
    Breakpoint,
    Exception,
    LoadDll,
    UnloadDll,
    Rip,
    Debug,
}

impl FromStr for FilterEvent {
    type Err = PlayerError;

    fn from_str(name: &str) -> Result<Self, PlayerError> {
        Ok(match name {
            "create_process" => FilterEvent::CreateProcess,
            "create_thread" => FilterEvent::CreateThread,
            "exit_process" => FilterEvent::ExitProcess,
            "exit_thread" => FilterEvent::ExitThread,
            "breakpoint" => FilterEvent::Breakpoint,
            "exception" => FilterEvent::Exception,
            "load_dll" => FilterEvent::LoadDll,
            "unload_dll" => FilterEvent::UnloadDll,
            "rip" => FilterEvent::Rip,
            "debug" => FilterEvent::Debug,
            _ => return Err(PlayerError::InvalidFilterEvent(name.to_string())),
        })
    }
}

/// An allowlist of event kinds to deliver during replay. Events outside
/// the list are still parsed (and still feed the module index), they just
/// never reach the sinks.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    allowed: HashSet<FilterEvent>,
}

impl EventFilter {
    pub fn from_names<I, S>(names: I) -> Result<Self, PlayerError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut allowed = HashSet::new();
        for name in names {
            allowed.insert(name.as_ref().parse()?);
        }
        Ok(EventFilter { allowed })
    }

    pub fn allows(&self, event: FilterEvent) -> bool {
        self.allowed.contains(&event)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PlayerOptions {
    /// Verify the whole-body CRC before and after replay. Disabling this
    /// lets a damaged or never-finalized log be read through as-is.
    pub skip_sanity_check: bool,
    pub filter: Option<EventFilter>,
}

pub struct BinaryLogPlayer<R: Read + Seek> {
    input: R,
    length: u64,
    header: FileHeader,
    crc: u32,
    modules: ModuleCollection,
    options: PlayerOptions,
}

impl BinaryLogPlayer<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>, options: PlayerOptions) -> Result<Self, PlayerError> {
        BinaryLogPlayer::new(BufReader::new(File::open(path)?), options)
    }
}

impl<R: Read + Seek> BinaryLogPlayer<R> {
    /// Read and validate the header; unless disabled, stream the whole body
    /// through the checksum before any event is replayed.
    pub fn new(mut input: R, options: PlayerOptions) -> Result<Self, PlayerError> {
        let length = input.seek(SeekFrom::End(0))?;
        input.seek(SeekFrom::Start(0))?;

        let mut player = BinaryLogPlayer {
            input,
            length,
            header: FileHeader {
                signature: [0; 4],
                version: 0,
                process_id: 0,
                thread_id: 0,
                path_length: 0,
                working_directory_length: 0,
                argument_count: 0,
                start_time: 0,
                crc32: 0,
            },
            crc: 0,
            modules: ModuleCollection::new(),
            options,
        };

        player.header = player.read_record(false)?;
        if player.header.signature != FILE_SIGNATURE {
            return Err(PlayerError::UnexpectedSignature {
                expected: FILE_SIGNATURE,
                found: player.header.signature,
            });
        }

        let (file_major, file_minor) = player.header.file_version();
        if (file_major, file_minor) != (VERSION_MAJOR, VERSION_MINOR) {
            return Err(PlayerError::UnsupportedVersion {
                file_major,
                file_minor,
                supported_major: VERSION_MAJOR,
                supported_minor: VERSION_MINOR,
            });
        }

        if !player.options.skip_sanity_check {
            player.check_sanity()?;
        }
        Ok(player)
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    /// Replay every recorded event into `sinks`, in recorded order.
    pub fn play(&mut self, sinks: &mut [&mut dyn EventSink]) -> Result<(), PlayerError> {
        let path = self.read_wide(self.header.path_length)?;
        let working_directory = self.read_wide(self.header.working_directory_length)?;
        let mut arguments = Vec::new();
        for _ in 0..self.header.argument_count {
            let byte_count: u32 = self.read_record(true)?;
            arguments.push(self.read_ansi(u64::from(byte_count))?);
        }

        let view = ProcessView {
            process_id: self.header.process_id,
            thread_id: self.header.thread_id,
            path,
            working_directory,
            arguments,
        };
        for sink in sinks.iter_mut() {
            sink.on_initialization(self.header.start_time, &view);
        }

        while self.remaining()? >= 4 {
            self.next(sinks)?;
        }

        let time = chrono::Utc::now().timestamp();
        for sink in sinks.iter_mut() {
            sink.on_module_collection_complete(time, &self.modules);
        }

        if !self.options.skip_sanity_check && self.crc != self.header.crc32 {
            return Err(PlayerError::ChecksumMismatch {
                stored: self.header.crc32,
                computed: self.crc,
            });
        }
        Ok(())
    }

    /// Walk the body once through the CRC and rewind. Performed before any
    /// event is emitted so damage is caught up front.
    fn check_sanity(&mut self) -> Result<(), PlayerError> {
        let start = self.input.stream_position()?;
        let mut crc = 0u32;
        let mut buffer = [0u8; SANITY_BUFFER_SIZE];
        loop {
            let read = self.input.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            crc = crc32::update(crc, &buffer[..read]);
        }
        self.input.seek(SeekFrom::Start(start))?;

        if crc != self.header.crc32 {
            return Err(PlayerError::ChecksumMismatch {
                stored: self.header.crc32,
                computed: crc,
            });
        }
        Ok(())
    }

    fn remaining(&mut self) -> Result<u64, PlayerError> {
        Ok(self.length - self.input.stream_position()?)
    }

    /// Read the next event frame and emit it.
    fn next(&mut self, sinks: &mut [&mut dyn EventSink]) -> Result<(), PlayerError> {
        let entry: EventEntry = self.peek_record()?;
        if entry.signature != EVENT_SIGNATURE {
            return Err(PlayerError::UnexpectedSignature {
                expected: EVENT_SIGNATURE,
                found: entry.signature,
            });
        }

        match entry.event_id {
            event::EVENT_ID_EXCEPTION => {
                let record: ExceptionEventEntry = self.read_record(true)?;
                self.emit_exception(record, sinks)
            }
            event::EVENT_ID_CREATE_PROCESS => {
                let record: CreateProcessEventEntry = self.read_record(true)?;
                self.emit_create_process(record, sinks)
            }
            event::EVENT_ID_CREATE_THREAD => {
                let record: CreateThreadEventEntry = self.read_record(true)?;
                self.emit_create_thread(record, sinks)
            }
            event::EVENT_ID_EXIT_PROCESS => {
                let record: ExitProcessEventEntry = self.read_record(true)?;
                self.emit_exit_process(record, sinks)
            }
            event::EVENT_ID_EXIT_THREAD => {
                let record: ExitThreadEventEntry = self.read_record(true)?;
                self.emit_exit_thread(record, sinks)
            }
            event::EVENT_ID_LOAD_DLL => {
                let record: DllLoadEventEntry = self.read_record(true)?;
                self.emit_dll_load(record, sinks)
            }
            event::EVENT_ID_UNLOAD_DLL => {
                let record: DllUnloadEventEntry = self.read_record(true)?;
                self.emit_dll_unload(record, sinks)
            }
            event::EVENT_ID_DEBUG_STRING => {
                let record: DebugStringEventEntry = self.read_record(true)?;
                self.emit_debug_string(record, sinks)
            }
            event::EVENT_ID_RIP => {
                let record: RipEventEntry = self.read_record(true)?;
                self.emit_rip(record, sinks)
            }
            other => Err(PlayerError::UnknownEventId(other)),
        }
    }

    fn allows(&self, kind: FilterEvent) -> bool {
        self.options
            .filter
            .as_ref()
            .map_or(true, |filter| filter.allows(kind))
    }

    fn emit_exception(
        &mut self,
        record: ExceptionEventEntry,
        sinks: &mut [&mut dyn EventSink],
    ) -> Result<(), PlayerError> {
        let entry = record.event;
        let pi = process_info(&entry);

        let context = if record.wow64 != 0 {
            let registers: ThreadContextX86 = self.read_record(true)?;
            DebugContext::from_x86(pi.process_handle, pi.thread_handle, registers)
        } else {
            let registers: ThreadContextX64 = self.read_record(true)?;
            DebugContext::from_x64(pi.process_handle, pi.thread_handle, registers)
        };

        let trace = self.read_trace()?;
        let rtti = if record.code == event::MSVC_EH_EXCEPTION {
            self.read_rtti_block()?
        } else {
            None
        };

        let is_breakpoint = record.is_breakpoint != 0;
        let wanted = if is_breakpoint {
            FilterEvent::Breakpoint
        } else {
            FilterEvent::Exception
        };
        let address = record.address;
        if !self.allows(wanted) {
            debug!("filtered exception event at {address:#x}");
            return Ok(());
        }

        let exception = ExceptionEvent {
            address,
            code: record.code,
            first_chance: record.is_first_chance != 0,
            wow64: record.wow64 != 0,
            rtti,
        };

        if is_breakpoint {
            for sink in sinks.iter_mut() {
                sink.on_breakpoint_hit(entry.time, &exception, &pi, &context, &trace, &self.modules);
            }
        } else {
            let name = exception_name(exception.code).unwrap_or("");
            for sink in sinks.iter_mut() {
                sink.on_exception(
                    entry.time,
                    &exception,
                    &pi,
                    name,
                    &context,
                    &trace,
                    &self.modules,
                );
            }
        }
        Ok(())
    }

    fn read_trace(&mut self) -> Result<StackTrace, PlayerError> {
        let header: TraceHeader = self.read_record(true)?;
        if header.signature != TRACE_SIGNATURE {
            return Err(PlayerError::UnexpectedSignature {
                expected: TRACE_SIGNATURE,
                found: header.signature,
            });
        }

        let mut entries = Vec::new();
        for _ in 0..header.entry_count {
            let record: TraceEntryRecord = self.read_record(true)?;
            let name = self.read_ansi(record.name_length)?;
            let file = self.read_wide(record.path_length)?;

            let mut instructions = Vec::new();
            for _ in 0..record.instruction_count {
                let instruction: TraceInstructionRecord = self.read_record(true)?;
                instructions.push(DecodedInstruction {
                    is_64bit: instruction.is_64bit_address != 0,
                    offset: instruction.offset,
                    size: instruction.size,
                    hex: self.read_ansi(instruction.hex_length)?,
                    mnemonic: self.read_ansi(instruction.mnemonic_length)?,
                    operands: self.read_ansi(instruction.operands_length)?,
                });
            }

            entries.push(StackFrameEntry {
                module: self.modules.module_at_address(record.address).cloned(),
                module_base: record.module_base,
                address: record.address,
                absolute_address: record.absolute_address,
                absolute_line_address: record.absolute_line_address,
                line_address: record.line_address,
                name,
                file,
                line: record.line_number as u32,
                recursion: record.is_recursion != 0,
                recursion_count: record.recursion_count,
                instructions,
            });
        }

        Ok(StackTrace::from_entries(
            header.max_recursion,
            header.max_instructions,
            entries,
        ))
    }

    /// Logs written before RTTI persistence carry no block after the trace;
    /// a peek keeps them readable.
    fn read_rtti_block(&mut self) -> Result<Option<ExceptionRtti>, PlayerError> {
        if self.remaining()? < 4 {
            return Ok(None);
        }
        if self.peek_signature()? != RTTI_SIGNATURE {
            return Ok(None);
        }

        let block: RttiBlock = self.read_record(true)?;
        let mut rtti = ExceptionRtti::default();
        for _ in 0..block.type_name_count {
            let length: u64 = self.read_record(true)?;
            rtti.type_names.push(self.read_ansi(length)?);
        }
        if block.message_length != 0 {
            rtti.message = Some(self.read_ansi(block.message_length)?);
        }
        if block.image_path_length != 0 {
            rtti.throw_image_path = Some(self.read_wide(block.image_path_length)?);
        }
        Ok(Some(rtti))
    }

    fn emit_create_process(
        &mut self,
        record: CreateProcessEventEntry,
        sinks: &mut [&mut dyn EventSink],
    ) -> Result<(), PlayerError> {
        let entry = record.event;
        let path = self.read_wide(record.path_length)?;

        // mirror the load so sinks resolve addresses like the live session
        self.modules.load(&path, record.module_base, record.module_size);

        if self.allows(FilterEvent::CreateProcess) {
            let pi = process_info(&entry);
            for sink in sinks.iter_mut() {
                sink.on_create_process(entry.time, record.module_base, &pi, &path, &self.modules);
            }
        }
        Ok(())
    }

    fn emit_create_thread(
        &mut self,
        record: CreateThreadEventEntry,
        sinks: &mut [&mut dyn EventSink],
    ) -> Result<(), PlayerError> {
        let entry = record.event;
        if self.allows(FilterEvent::CreateThread) {
            let pi = process_info(&entry);
            for sink in sinks.iter_mut() {
                sink.on_create_thread(entry.time, record.entry_point, &pi, &self.modules);
            }
        }
        Ok(())
    }

    fn emit_exit_process(
        &mut self,
        record: ExitProcessEventEntry,
        sinks: &mut [&mut dyn EventSink],
    ) -> Result<(), PlayerError> {
        let entry = record.event;
        if self.allows(FilterEvent::ExitProcess) {
            let pi = process_info(&entry);
            for sink in sinks.iter_mut() {
                sink.on_exit_process(entry.time, record.exit_code, &pi, &self.modules);
            }
        }
        Ok(())
    }

    fn emit_exit_thread(
        &mut self,
        record: ExitThreadEventEntry,
        sinks: &mut [&mut dyn EventSink],
    ) -> Result<(), PlayerError> {
        let entry = record.event;
        if self.allows(FilterEvent::ExitThread) {
            let pi = process_info(&entry);
            for sink in sinks.iter_mut() {
                sink.on_exit_thread(entry.time, record.exit_code, &pi, &self.modules);
            }
        }
        Ok(())
    }

    fn emit_dll_load(
        &mut self,
        record: DllLoadEventEntry,
        sinks: &mut [&mut dyn EventSink],
    ) -> Result<(), PlayerError> {
        let entry = record.event;
        let path = self.read_wide(record.path_length)?;

        self.modules.load(&path, record.module_base, record.module_size);

        if self.allows(FilterEvent::LoadDll) {
            let pi = process_info(&entry);
            let index = self.modules.index_of_path(&path);
            for sink in sinks.iter_mut() {
                sink.on_dll_load(entry.time, record.module_base, &pi, &path, index, &self.modules);
            }
        }
        Ok(())
    }

    fn emit_dll_unload(
        &mut self,
        record: DllUnloadEventEntry,
        sinks: &mut [&mut dyn EventSink],
    ) -> Result<(), PlayerError> {
        let entry = record.event;
        if self.allows(FilterEvent::UnloadDll) {
            let pi = process_info(&entry);
            let path = self.modules.path_at(record.module_base).to_string();
            let index = self.modules.index_of_path(&path);
            for sink in sinks.iter_mut() {
                sink.on_dll_unload(entry.time, record.module_base, &pi, &path, index, &self.modules);
            }
        }

        // unload after the fan-out so sinks saw the module while active
        self.modules.unload(record.module_base);
        Ok(())
    }

    fn emit_debug_string(
        &mut self,
        record: DebugStringEventEntry,
        sinks: &mut [&mut dyn EventSink],
    ) -> Result<(), PlayerError> {
        let entry = record.event;
        let message = if record.is_unicode != 0 {
            self.read_wide(record.length)?
        } else {
            self.read_ansi(record.length)?
        };

        if self.allows(FilterEvent::Debug) {
            let pi = process_info(&entry);
            if record.is_unicode != 0 {
                for sink in sinks.iter_mut() {
                    sink.on_debug_string_wide(entry.time, &pi, &message);
                }
            } else {
                for sink in sinks.iter_mut() {
                    sink.on_debug_string(entry.time, &pi, &message);
                }
            }
        }
        Ok(())
    }

    fn emit_rip(
        &mut self,
        record: RipEventEntry,
        sinks: &mut [&mut dyn EventSink],
    ) -> Result<(), PlayerError> {
        let entry = record.event;
        if self.allows(FilterEvent::Rip) {
            let pi = process_info(&entry);
            let info = RipInfo {
                kind: record.kind,
                error: record.error,
            };
            // the message text is never persisted, re-resolve it here
            let message = strings::os_error_message(info.error);
            for sink in sinks.iter_mut() {
                sink.on_rip(entry.time, &info, &pi, &message);
            }
        }
        Ok(())
    }

    fn read_record<T: plain::Plain + Copy>(&mut self, checksummed: bool) -> Result<T, PlayerError> {
        let mut bytes = vec![0u8; std::mem::size_of::<T>()];
        self.input
            .read_exact(&mut bytes)
            .map_err(PlayerError::from_read)?;
        if checksummed {
            self.crc = crc32::update(self.crc, &bytes);
        }
        Ok(format::pod_from_bytes(&bytes))
    }

    /// Read a record without consuming it or folding it into the CRC.
    fn peek_record<T: plain::Plain + Copy>(&mut self) -> Result<T, PlayerError> {
        let position = self.input.stream_position()?;
        let result = self.read_record(false);
        self.input.seek(SeekFrom::Start(position))?;
        result
    }

    fn peek_signature(&mut self) -> Result<[u8; 4], PlayerError> {
        let position = self.input.stream_position()?;
        let mut signature = [0u8; 4];
        self.input
            .read_exact(&mut signature)
            .map_err(PlayerError::from_read)?;
        self.input.seek(SeekFrom::Start(position))?;
        Ok(signature)
    }

    fn read_ansi(&mut self, byte_count: u64) -> Result<String, PlayerError> {
        let mut bytes = vec![0u8; byte_count as usize];
        self.input
            .read_exact(&mut bytes)
            .map_err(PlayerError::from_read)?;
        self.crc = crc32::update(self.crc, &bytes);
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn read_wide(&mut self, unit_count: u64) -> Result<String, PlayerError> {
        let mut bytes = vec![0u8; unit_count as usize * 2];
        self.input
            .read_exact(&mut bytes)
            .map_err(PlayerError::from_read)?;
        self.crc = crc32::update(self.crc, &bytes);
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Ok(strings::from_utf16(&units))
    }
}

fn process_info(entry: &EventEntry) -> ProcessInfo {
    let pi = entry.pi;
    ProcessInfo {
        process_handle: pi.process_handle,
        thread_handle: pi.thread_handle,
        process_id: pi.process_id,
        thread_id: pi.thread_id,
    }
}
