//! The debug-event pump. Live sessions attach to a running debuggee and
//! loop on `WaitForDebugEventEx`; postmortem sessions are handed one crash
//! by the OS JIT-debugger machinery. Both paths normalize into the same
//! sink fan-out, and every exception is answered with "not handled" so the
//! debuggee's own handlers still run.

use std::io::BufRead;

use log::warn;

use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, DBG_CONTINUE, DBG_EXCEPTION_NOT_HANDLED, HANDLE,
};
use windows_sys::Win32::System::Diagnostics::Debug::{
    ContinueDebugEvent, DebugActiveProcess, DebugActiveProcessStop, DebugSetProcessKillOnExit,
    WaitForDebugEventEx, CREATE_PROCESS_DEBUG_EVENT, CREATE_THREAD_DEBUG_EVENT, DEBUG_EVENT,
    EXCEPTION_DEBUG_EVENT, EXIT_PROCESS_DEBUG_EVENT, EXIT_THREAD_DEBUG_EVENT, JIT_DEBUG_INFO,
    LOAD_DLL_DEBUG_EVENT, OUTPUT_DEBUG_STRING_EVENT, RIP_EVENT, UNLOAD_DLL_DEBUG_EVENT,
};
use windows_sys::Win32::System::Threading::{
    OpenProcess, OpenThread, SetEvent, INFINITE, PROCESS_ALL_ACCESS, THREAD_ALL_ACCESS,
};

use crate::debug_context::DebugContext;
use crate::errors::SessionError;
use crate::event::{
    exception_name, ExceptionEvent, ProcessInfo, ProcessView, RipInfo, EXCEPTION_BREAKPOINT,
    STATUS_WX86_BREAKPOINT,
};
use crate::memory::MemoryReaderExt;
use crate::module_collection::ModuleCollection;
use crate::rtti::ExceptionRtti;
use crate::sink::EventSink;
use crate::stack_trace::StackTrace;
use crate::strings;
use crate::windows::disasm::CapstoneDecoder;
use crate::windows::process::{path_from_file_handle, RemoteMemory, TargetProcess};
use crate::windows::sym::{DbgHelpSession, DbgHelpWalker};

/// `EXCEPTION_RECORD` as it sits in the debuggee, read remotely on the
/// postmortem path.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct RemoteExceptionRecord {
    code: i32,
    flags: u32,
    chained_record: u64,
    address: u64,
    number_parameters: u32,
    _reserved: u32,
    information: [u64; 15],
}

// SAFETY: plain data read straight out of the debuggee.
unsafe impl plain::Plain for RemoteExceptionRecord {}

const _: () = assert!(std::mem::size_of::<RemoteExceptionRecord>() == 152);

#[derive(Debug, Clone, Default)]
pub struct DebuggerOptions {
    /// Recursion-collapse threshold for stack traces, 0 = unlimited.
    pub max_recursion: u64,
    /// Instructions to disassemble per frame, 0 = none.
    pub max_instructions: u64,
    pub pdb_search_paths: Vec<String>,
    /// Also search for PDBs next to the debuggee image.
    pub pdb_search_self: bool,
    pub break_on_breakpoints: bool,
    pub break_on_exceptions: bool,
    pub break_on_first_chance_only: bool,
    pub kill_on_detach: bool,
}

struct JitHandoff {
    event: HANDLE,
    info: JIT_DEBUG_INFO,
}

pub struct Debugger {
    process: TargetProcess,
    options: DebuggerOptions,
    modules: ModuleCollection,
    jit: Option<JitHandoff>,
}

impl Debugger {
    /// A live debugging session for a running process.
    pub fn new(process: TargetProcess, options: DebuggerOptions) -> Result<Self, SessionError> {
        if !process.is_running() {
            return Err(SessionError::ProcessNotRunning);
        }
        Ok(Debugger {
            process,
            options,
            modules: ModuleCollection::new(),
            jit: None,
        })
    }

    /// A postmortem session: the OS invoked us with the crashed process
    /// id, an event handle to signal when done, and the address of a
    /// `JIT_DEBUG_INFO` block inside the debuggee.
    pub fn new_postmortem(
        mut process: TargetProcess,
        options: DebuggerOptions,
        jit_event: HANDLE,
        jit_info_address: u64,
    ) -> Result<Self, SessionError> {
        if !process.is_running() {
            return Err(SessionError::ProcessNotRunning);
        }

        let info: JIT_DEBUG_INFO = process.memory().read_value(jit_info_address)?;
        process.attach_thread(info.dwThreadID)?;

        Ok(Debugger {
            process,
            options,
            modules: ModuleCollection::new(),
            jit: Some(JitHandoff {
                event: jit_event,
                info,
            }),
        })
    }

    /// Attach and emit the initialization event. Postmortem sessions do
    /// their entire run here: one exception, then termination.
    pub fn attach(&mut self, sinks: &mut [&mut dyn EventSink]) -> Result<(), SessionError> {
        if self.jit.is_some() {
            return self.run_postmortem(sinks);
        }

        // SAFETY: syscall
        if unsafe { DebugActiveProcess(self.process.process_id) } == 0 {
            // SAFETY: syscall
            return Err(SessionError::AttachFailed(unsafe { GetLastError() }));
        }
        if !self.options.kill_on_detach {
            // SAFETY: syscall
            unsafe { DebugSetProcessKillOnExit(0) };
        }

        let view = self.process_view();
        let time = now();
        for sink in sinks.iter_mut() {
            sink.on_initialization(time, &view);
        }
        Ok(())
    }

    pub fn detach(&self) -> bool {
        // SAFETY: syscall
        unsafe { DebugActiveProcessStop(self.process.process_id) != 0 }
    }

    /// Pump debug events until the debuggee exits, then finalize sinks.
    pub fn run(&mut self, sinks: &mut [&mut dyn EventSink]) -> Result<(), SessionError> {
        while self.tick(sinks)? {}

        let time = now();
        for sink in sinks.iter_mut() {
            sink.on_module_collection_complete(time, &self.modules);
        }
        Ok(())
    }

    pub fn process(&self) -> &TargetProcess {
        &self.process
    }

    fn process_view(&self) -> ProcessView {
        ProcessView {
            process_id: self.process.process_id,
            thread_id: self.process.thread_id,
            path: self.process.path.clone(),
            working_directory: self.process.working_directory.clone(),
            arguments: self.process.arguments.clone(),
        }
    }

    fn search_paths(&self) -> Vec<String> {
        let mut paths = self.options.pdb_search_paths.clone();
        if self.options.pdb_search_self {
            if let Some(parent) = std::path::Path::new(&self.process.path).parent() {
                paths.push(parent.to_string_lossy().into_owned());
            }
        }
        paths
    }

    /// Wait for one debug event, fan it out, reply to the OS. Returns
    /// `false` once the debuggee exits.
    fn tick(&mut self, sinks: &mut [&mut dyn EventSink]) -> Result<bool, SessionError> {
        // SAFETY: all-zero DEBUG_EVENT is a valid out-param.
        let mut event: DEBUG_EVENT = unsafe { std::mem::zeroed() };
        // SAFETY: syscall, blocking wait.
        if unsafe { WaitForDebugEventEx(&mut event, INFINITE) } == 0 {
            return Ok(true);
        }

        let mut stay = true;
        let mut continue_status = DBG_CONTINUE;

        // SAFETY: syscall
        let process_handle = unsafe { OpenProcess(PROCESS_ALL_ACCESS, 0, event.dwProcessId) };
        if process_handle == 0 {
            warn!("cannot open process {:#x} for event", event.dwProcessId);
            return Ok(true);
        }
        // SAFETY: syscall
        let thread_handle = unsafe { OpenThread(THREAD_ALL_ACCESS, 0, event.dwThreadId) };
        if thread_handle == 0 {
            warn!("cannot open thread {:#x} for event", event.dwThreadId);
            // SAFETY: opened above
            unsafe { CloseHandle(process_handle) };
            return Ok(true);
        }

        let pi = ProcessInfo {
            process_handle: process_handle as u64,
            thread_handle: thread_handle as u64,
            process_id: event.dwProcessId,
            thread_id: event.dwThreadId,
        };
        let time = now();
        let memory = RemoteMemory::new(process_handle);

        match event.dwDebugEventCode {
            EXCEPTION_DEBUG_EVENT => {
                // this debugger records exceptions, it never handles them
                continue_status = DBG_EXCEPTION_NOT_HANDLED;
                // SAFETY: union member selected by the event code.
                let info = unsafe { &event.u.Exception };
                self.dispatch_exception(sinks, &pi, time, process_handle, thread_handle, info);
            }

            CREATE_PROCESS_DEBUG_EVENT => {
                // SAFETY: union member selected by the event code.
                let info = unsafe { &event.u.CreateProcessInfo };
                let path = path_from_file_handle(info.hFile);
                self.modules
                    .load_probed(&memory, &path, info.lpBaseOfImage as u64);
                for sink in sinks.iter_mut() {
                    sink.on_create_process(time, info.lpBaseOfImage as u64, &pi, &path, &self.modules);
                }
                if info.hFile != 0 {
                    // SAFETY: the debugger owns the delivered file handle
                    unsafe { CloseHandle(info.hFile) };
                }
            }

            CREATE_THREAD_DEBUG_EVENT => {
                // SAFETY: union member selected by the event code.
                let info = unsafe { &event.u.CreateThread };
                let entry_point = info.lpStartAddress.map_or(0, |f| f as usize as u64);
                for sink in sinks.iter_mut() {
                    sink.on_create_thread(time, entry_point, &pi, &self.modules);
                }
            }

            EXIT_PROCESS_DEBUG_EVENT => {
                stay = false;
                // SAFETY: union member selected by the event code.
                let exit_code = unsafe { event.u.ExitProcess.dwExitCode };
                for sink in sinks.iter_mut() {
                    sink.on_exit_process(time, exit_code, &pi, &self.modules);
                }
            }

            EXIT_THREAD_DEBUG_EVENT => {
                // SAFETY: union member selected by the event code.
                let exit_code = unsafe { event.u.ExitThread.dwExitCode };
                for sink in sinks.iter_mut() {
                    sink.on_exit_thread(time, exit_code, &pi, &self.modules);
                }
            }

            LOAD_DLL_DEBUG_EVENT => {
                // SAFETY: union member selected by the event code.
                let info = unsafe { &event.u.LoadDll };
                let path = path_from_file_handle(info.hFile);
                let base = info.lpBaseOfDll as u64;
                self.modules.load_probed(&memory, &path, base);
                let index = self.modules.index_of_path(&path);
                for sink in sinks.iter_mut() {
                    sink.on_dll_load(time, base, &pi, &path, index, &self.modules);
                }
                if info.hFile != 0 {
                    // SAFETY: the debugger owns the delivered file handle
                    unsafe { CloseHandle(info.hFile) };
                }
            }

            UNLOAD_DLL_DEBUG_EVENT => {
                // SAFETY: union member selected by the event code.
                let base = unsafe { event.u.UnloadDll.lpBaseOfDll as u64 };
                let path = self.modules.path_at(base).to_string();
                let index = self.modules.index_of_path(&path);
                for sink in sinks.iter_mut() {
                    sink.on_dll_unload(time, base, &pi, &path, index, &self.modules);
                }
                self.modules.unload(base);
            }

            OUTPUT_DEBUG_STRING_EVENT => {
                // SAFETY: union member selected by the event code.
                let info = unsafe { &event.u.DebugString };
                let address = info.lpDebugStringData as u64;
                let length = usize::from(info.nDebugStringLength);
                if info.fUnicode != 0 {
                    let raw = self.process.read_string_w(address, length);
                    let message = strings::trim_debug_string(&raw);
                    for sink in sinks.iter_mut() {
                        sink.on_debug_string_wide(time, &pi, message);
                    }
                } else {
                    let raw = self.process.read_string(address, length);
                    let message = strings::trim_debug_string(&raw);
                    for sink in sinks.iter_mut() {
                        sink.on_debug_string(time, &pi, message);
                    }
                }
            }

            RIP_EVENT => {
                // SAFETY: union member selected by the event code.
                let info = unsafe { &event.u.RipInfo };
                let rip = RipInfo {
                    kind: info.dwType,
                    error: info.dwError,
                };
                let message = strings::os_error_message(rip.error);
                for sink in sinks.iter_mut() {
                    sink.on_rip(time, &rip, &pi, &message);
                }
            }

            other => warn!("unknown debug event {other}"),
        }

        // SAFETY: per-event handles opened above.
        unsafe {
            CloseHandle(thread_handle);
            CloseHandle(process_handle);
        }
        // SAFETY: syscall; replies to the event waited on above.
        unsafe {
            ContinueDebugEvent(event.dwProcessId, event.dwThreadId, continue_status as u32);
        }

        Ok(stay)
    }

    fn dispatch_exception(
        &mut self,
        sinks: &mut [&mut dyn EventSink],
        pi: &ProcessInfo,
        time: i64,
        process_handle: HANDLE,
        thread_handle: HANDLE,
        info: &windows_sys::Win32::System::Diagnostics::Debug::EXCEPTION_DEBUG_INFO,
    ) {
        let record = &info.ExceptionRecord;
        let code = record.ExceptionCode as u32;
        let address = record.ExceptionAddress as u64;
        let first_chance = info.dwFirstChance != 0;
        let parameters: Vec<u64> = record.ExceptionInformation
            [..record.NumberParameters.min(15) as usize]
            .iter()
            .map(|&parameter| parameter as u64)
            .collect();

        let Ok(context) = self.process.thread_context(thread_handle) else {
            warn!("cannot capture thread context for exception {code:#x}");
            return;
        };

        let memory = RemoteMemory::new(process_handle);
        let trace = self.capture_trace(process_handle, thread_handle, &memory, &context);

        if matches!(code, EXCEPTION_BREAKPOINT | STATUS_WX86_BREAKPOINT) {
            let exception = ExceptionEvent {
                address,
                code,
                first_chance,
                wow64: !context.is_64(),
                rtti: None,
            };
            for sink in sinks.iter_mut() {
                sink.on_breakpoint_hit(time, &exception, pi, &context, &trace, &self.modules);
            }
            if self.options.break_on_breakpoints {
                pause_for_keypress();
            }
        } else {
            let rtti =
                ExceptionRtti::decode(&memory, &self.modules, code, &parameters, context.is_64());
            let exception = ExceptionEvent {
                address,
                code,
                first_chance,
                wow64: !context.is_64(),
                rtti,
            };
            let name = exception_name(code).unwrap_or("");
            for sink in sinks.iter_mut() {
                sink.on_exception(time, &exception, pi, name, &context, &trace, &self.modules);
            }
            if self.options.break_on_exceptions
                && (!self.options.break_on_first_chance_only || first_chance)
            {
                pause_for_keypress();
            }
        }
    }

    fn capture_trace(
        &self,
        process_handle: HANDLE,
        thread_handle: HANDLE,
        memory: &RemoteMemory,
        context: &DebugContext,
    ) -> StackTrace {
        let mut session = DbgHelpSession::initialize(process_handle, &self.search_paths());
        let mut walker = DbgHelpWalker::new(process_handle, thread_handle, context);
        StackTrace::capture(
            context,
            &self.modules,
            memory,
            &mut walker,
            &mut session,
            &CapstoneDecoder,
            self.options.max_recursion,
            self.options.max_instructions,
        )
    }

    /// The postmortem run: synthesize load events for every mapped module,
    /// emit the one recorded exception, terminate the debuggee with its
    /// code and release the OS crash reporter.
    fn run_postmortem(&mut self, sinks: &mut [&mut dyn EventSink]) -> Result<(), SessionError> {
        let time = now();
        let view = self.process_view();
        for sink in sinks.iter_mut() {
            sink.on_initialization(time, &view);
        }

        let pi = ProcessInfo {
            process_handle: self.process.process_handle() as u64,
            thread_handle: self.process.thread_handle() as u64,
            process_id: self.process.process_id,
            thread_id: self.process.thread_id,
        };

        // replay the already-loaded modules so address resolution works
        for (base, path, size) in self.process.enumerate_modules() {
            self.modules.load(&path, base, size);
            let index = self.modules.index_of_path(&path);
            for sink in sinks.iter_mut() {
                sink.on_dll_load(time, base, &pi, &path, index, &self.modules);
            }
        }

        let Some(jit) = self.jit.take() else {
            return Ok(());
        };
        let memory = self.process.memory();

        let context = if self.process.is_wow64() {
            let registers = memory.read_value(jit.info.lpContextRecord)?;
            DebugContext::from_x86(pi.process_handle, pi.thread_handle, registers)
        } else {
            let registers = memory.read_value(jit.info.lpContextRecord)?;
            DebugContext::from_x64(pi.process_handle, pi.thread_handle, registers)
        };

        let record: RemoteExceptionRecord = memory.read_value(jit.info.lpExceptionRecord)?;
        let code = record.code as u32;
        let parameters: Vec<u64> =
            record.information[..record.number_parameters.min(15) as usize].to_vec();
        let rtti = ExceptionRtti::decode(&memory, &self.modules, code, &parameters, context.is_64());

        let trace = self.capture_trace(
            self.process.process_handle(),
            self.process.thread_handle(),
            &memory,
            &context,
        );

        let exception = ExceptionEvent {
            // the handoff block carries the faulting address
            address: jit.info.lpExceptionAddress,
            code,
            first_chance: false,
            wow64: !context.is_64(),
            rtti,
        };
        let name = exception_name(code).unwrap_or("");
        for sink in sinks.iter_mut() {
            sink.on_exception(time, &exception, &pi, name, &context, &trace, &self.modules);
        }
        for sink in sinks.iter_mut() {
            sink.on_module_collection_complete(time, &self.modules);
        }

        // killing the debuggee may retrigger JIT debugging, but the next
        // instance exits as soon as it finds the process gone
        self.process.terminate(code);
        // SAFETY: syscall; releases the OS crash reporter.
        unsafe { SetEvent(jit.event) };

        Ok(())
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Block until the operator picks `c`ontinue or `a`bort; abort kills the
/// debuggee on detach and exits.
fn pause_for_keypress() {
    let stdin = std::io::stdin();
    loop {
        println!("[c]ontinue or [a]bort?");
        let mut line = String::new();
        if stdin.lock().read_line(&mut line).is_err() {
            return;
        }
        match line.trim().chars().next().map(|c| c.to_ascii_lowercase()) {
            Some('c') => return,
            Some('a') => {
                // SAFETY: syscall
                unsafe { DebugSetProcessKillOnExit(1) };
                std::process::exit(0);
            }
            _ => {}
        }
    }
}
