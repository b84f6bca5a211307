//! The target-process facade: owns the process and main-thread handles,
//! reads remote memory and strings, enumerates modules and captures thread
//! contexts at the right bitness.

use std::ffi::c_void;

use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, HANDLE, MAX_PATH, STILL_ACTIVE,
};
use windows_sys::Win32::Storage::FileSystem::GetFinalPathNameByHandleW;
use windows_sys::Win32::System::Diagnostics::Debug::{
    GetThreadContext, ReadProcessMemory, Wow64GetThreadContext, CONTEXT, WOW64_CONTEXT,
};
use windows_sys::Win32::System::ProcessStatus::{
    EnumProcessModulesEx, GetModuleFileNameExW, GetModuleInformation, LIST_MODULES_ALL,
    MODULEINFO,
};
use windows_sys::Win32::System::Threading::{
    CreateProcessW, GetExitCodeProcess, IsWow64Process, OpenProcess, OpenThread, ResumeThread,
    SuspendThread, TerminateProcess, CREATE_SUSPENDED, PROCESS_ALL_ACCESS,
    PROCESS_INFORMATION, STARTUPINFOW, THREAD_ALL_ACCESS,
};

use crate::debug_context::{DebugContext, ThreadContextX64, ThreadContextX86};
use crate::errors::{RemoteReadError, SessionError};
use crate::memory::MemoryReader;
use crate::strings;

// CONTEXT_ALL for AMD64 and for the Wow64 (x86) register file.
const CONTEXT_ALL_AMD64: u32 = 0x0010_001F;
const WOW64_CONTEXT_ALL: u32 = 0x0001_003F;

/// A [`MemoryReader`] over one process handle. Copyable so trace capture
/// and RTTI decoding can borrow it independently of the facade.
#[derive(Clone, Copy)]
pub struct RemoteMemory {
    process: HANDLE,
}

impl RemoteMemory {
    pub fn new(process: HANDLE) -> Self {
        RemoteMemory { process }
    }
}

impl MemoryReader for RemoteMemory {
    fn read(&self, address: u64, buffer: &mut [u8]) -> Result<(), RemoteReadError> {
        let mut read = 0usize;
        // SAFETY: syscall; the destination is a live, exactly-sized buffer.
        let ok = unsafe {
            ReadProcessMemory(
                self.process,
                address as *const c_void,
                buffer.as_mut_ptr().cast(),
                buffer.len(),
                &mut read,
            )
        };
        if ok == 0 || read != buffer.len() {
            return Err(RemoteReadError {
                address,
                length: buffer.len(),
                // SAFETY: syscall
                os_error: unsafe { GetLastError() },
            });
        }
        Ok(())
    }
}

/// A debuggee the session owns handles to. Closing the handles is
/// guaranteed on drop.
pub struct TargetProcess {
    pub process_id: u32,
    pub thread_id: u32,
    pub path: String,
    pub working_directory: String,
    pub arguments: Vec<String>,
    process: HANDLE,
    thread: HANDLE,
}

impl TargetProcess {
    /// Launch a program suspended so the debugger can attach before the
    /// first instruction runs.
    pub fn start_suspended(
        path: &str,
        working_directory: &str,
        arguments: &[String],
    ) -> Result<Self, SessionError> {
        let mut command_line = quote_argument(path);
        for argument in arguments {
            command_line.push(' ');
            command_line.push_str(&quote_argument(argument));
        }
        let mut command_line_w = strings::to_utf16(&command_line);
        command_line_w.push(0);
        let mut path_w = strings::to_utf16(path);
        path_w.push(0);
        let mut directory_w = strings::to_utf16(working_directory);
        directory_w.push(0);

        // SAFETY: zero-initialized STARTUPINFOW with only cb set is valid.
        let mut startup: STARTUPINFOW = unsafe { std::mem::zeroed() };
        startup.cb = std::mem::size_of::<STARTUPINFOW>() as u32;
        // SAFETY: as above.
        let mut info: PROCESS_INFORMATION = unsafe { std::mem::zeroed() };

        // SAFETY: syscall; all strings are NUL-terminated UTF-16 buffers
        // that outlive the call.
        let ok = unsafe {
            CreateProcessW(
                path_w.as_ptr(),
                command_line_w.as_mut_ptr(),
                std::ptr::null(),
                std::ptr::null(),
                0,
                CREATE_SUSPENDED,
                std::ptr::null(),
                if working_directory.is_empty() {
                    std::ptr::null()
                } else {
                    directory_w.as_ptr()
                },
                &startup,
                &mut info,
            )
        };
        if ok == 0 {
            // SAFETY: syscall
            return Err(SessionError::LaunchFailed(unsafe { GetLastError() }));
        }

        Ok(TargetProcess {
            process_id: info.dwProcessId,
            thread_id: info.dwThreadId,
            path: path.to_string(),
            working_directory: working_directory.to_string(),
            arguments: arguments.to_vec(),
            process: info.hProcess,
            thread: info.hThread,
        })
    }

    /// Open a running process with all access, the postmortem entry path.
    /// The faulting thread is attached later, from the JIT handoff data.
    pub fn open(process_id: u32) -> Result<Self, SessionError> {
        // SAFETY: syscall
        let process = unsafe { OpenProcess(PROCESS_ALL_ACCESS, 0, process_id) };
        if process == 0 {
            // SAFETY: syscall
            return Err(SessionError::OpenProcessFailed(unsafe { GetLastError() }));
        }

        let mut target = TargetProcess {
            process_id,
            thread_id: 0,
            path: String::new(),
            working_directory: String::new(),
            arguments: Vec::new(),
            process,
            thread: 0,
        };
        target.path = target.image_path();
        Ok(target)
    }

    /// Open and adopt the given thread as the main thread of interest.
    pub fn attach_thread(&mut self, thread_id: u32) -> Result<(), SessionError> {
        // SAFETY: syscall
        let thread = unsafe { OpenThread(THREAD_ALL_ACCESS, 0, thread_id) };
        if thread == 0 {
            // SAFETY: syscall
            return Err(SessionError::OpenProcessFailed(unsafe { GetLastError() }));
        }
        if self.thread != 0 {
            // SAFETY: handle owned by this facade
            unsafe { CloseHandle(self.thread) };
        }
        self.thread = thread;
        self.thread_id = thread_id;
        Ok(())
    }

    pub fn process_handle(&self) -> HANDLE {
        self.process
    }

    pub fn thread_handle(&self) -> HANDLE {
        self.thread
    }

    pub fn memory(&self) -> RemoteMemory {
        RemoteMemory::new(self.process)
    }

    pub fn resume(&self) -> bool {
        // SAFETY: syscall
        unsafe { ResumeThread(self.thread) != u32::MAX }
    }

    pub fn suspend(&self) -> bool {
        // SAFETY: syscall
        unsafe { SuspendThread(self.thread) != u32::MAX }
    }

    pub fn is_running(&self) -> bool {
        let mut exit_code = 0u32;
        // SAFETY: syscall
        if unsafe { GetExitCodeProcess(self.process, &mut exit_code) } == 0 {
            return false;
        }
        exit_code == STILL_ACTIVE as u32
    }

    pub fn is_wow64(&self) -> bool {
        let mut wow64 = 0i32;
        // SAFETY: syscall
        unsafe { IsWow64Process(self.process, &mut wow64) };
        wow64 != 0
    }

    pub fn terminate(&self, exit_code: u32) {
        // SAFETY: syscall
        unsafe { TerminateProcess(self.process, exit_code) };
    }

    /// Full path of the process image, empty when it cannot be queried.
    pub fn image_path(&self) -> String {
        let mut buffer = [0u16; MAX_PATH as usize + 1];
        // SAFETY: syscall; module 0 names the main image.
        let length = unsafe {
            GetModuleFileNameExW(self.process, 0, buffer.as_mut_ptr(), buffer.len() as u32)
        };
        strings::from_utf16(&buffer[..length as usize])
    }

    /// All modules currently mapped into the debuggee, as
    /// `(base, path, size)` triples. Modules whose information cannot be
    /// queried are skipped.
    pub fn enumerate_modules(&self) -> Vec<(u64, String, u64)> {
        let mut needed = 0u32;
        // SAFETY: syscall; probing call to size the handle array.
        unsafe {
            EnumProcessModulesEx(
                self.process,
                std::ptr::null_mut(),
                0,
                &mut needed,
                LIST_MODULES_ALL,
            );
        }

        let mut handles = vec![0isize; needed as usize / std::mem::size_of::<isize>()];
        let byte_len = (handles.len() * std::mem::size_of::<isize>()) as u32;
        // SAFETY: syscall; the array was sized by the probing call.
        let ok = unsafe {
            EnumProcessModulesEx(
                self.process,
                handles.as_mut_ptr(),
                byte_len,
                &mut needed,
                LIST_MODULES_ALL,
            )
        };
        if ok == 0 {
            return Vec::new();
        }
        handles.truncate(needed as usize / std::mem::size_of::<isize>());

        let mut modules = Vec::new();
        for handle in handles {
            let mut name = [0u16; MAX_PATH as usize + 1];
            // SAFETY: syscall
            let length = unsafe {
                GetModuleFileNameExW(self.process, handle, name.as_mut_ptr(), name.len() as u32)
            };
            let path = strings::from_utf16(&name[..length as usize]);

            // SAFETY: zero-initialized out-param filled by the call below.
            let mut info: MODULEINFO = unsafe { std::mem::zeroed() };
            // SAFETY: syscall
            let ok = unsafe {
                GetModuleInformation(
                    self.process,
                    handle,
                    &mut info,
                    std::mem::size_of::<MODULEINFO>() as u32,
                )
            };
            if ok != 0 {
                modules.push((info.lpBaseOfDll as u64, path, u64::from(info.SizeOfImage)));
            }
        }
        modules
    }

    /// Capture the register file of a thread, picking the 32- or 64-bit
    /// variant from the process's Wow64 bit.
    pub fn thread_context(&self, thread: HANDLE) -> Result<DebugContext, SessionError> {
        let process_handle = self.process as u64;
        let thread_handle = thread as u64;

        if self.is_wow64() {
            let mut context = ThreadContextX86 {
                context_flags: WOW64_CONTEXT_ALL,
                ..Default::default()
            };
            // SAFETY: syscall; ThreadContextX86 mirrors WOW64_CONTEXT.
            let ok = unsafe {
                Wow64GetThreadContext(thread, (&mut context as *mut ThreadContextX86).cast())
            };
            if ok == 0 {
                return Err(SessionError::Io(std::io::Error::last_os_error()));
            }
            Ok(DebugContext::from_x86(process_handle, thread_handle, context))
        } else {
            let mut context = ThreadContextX64 {
                context_flags: CONTEXT_ALL_AMD64,
                ..Default::default()
            };
            // SAFETY: syscall; ThreadContextX64 mirrors the x64 CONTEXT
            // layout and carries its 16-byte alignment.
            let ok = unsafe {
                GetThreadContext(thread, (&mut context as *mut ThreadContextX64).cast())
            };
            if ok == 0 {
                return Err(SessionError::Io(std::io::Error::last_os_error()));
            }
            Ok(DebugContext::from_x64(process_handle, thread_handle, context))
        }
    }

    /// Read an ANSI string of a known byte length out of the debuggee.
    pub fn read_string(&self, address: u64, byte_length: usize) -> String {
        let mut bytes = vec![0u8; byte_length];
        match self.memory().read(address, &mut bytes) {
            Ok(()) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => String::new(),
        }
    }

    /// Read a wide string of a known unit count out of the debuggee.
    pub fn read_string_w(&self, address: u64, unit_count: usize) -> String {
        use crate::memory::MemoryReaderExt;
        self.memory()
            .read_string_w(address, unit_count * 2)
            .unwrap_or_default()
    }
}

impl MemoryReader for TargetProcess {
    fn read(&self, address: u64, buffer: &mut [u8]) -> Result<(), RemoteReadError> {
        self.memory().read(address, buffer)
    }
}

impl Drop for TargetProcess {
    fn drop(&mut self) {
        // SAFETY: handles owned by this facade
        unsafe {
            if self.thread != 0 {
                CloseHandle(self.thread);
            }
            if self.process != 0 {
                CloseHandle(self.process);
            }
        }
    }
}

/// Full path behind an open file handle, as delivered with process-create
/// and DLL-load debug events.
pub fn path_from_file_handle(file: HANDLE) -> String {
    let mut buffer = [0u16; 1024];
    // SAFETY: syscall; FILE_NAME_NORMALIZED | VOLUME_NAME_DOS.
    let length =
        unsafe { GetFinalPathNameByHandleW(file, buffer.as_mut_ptr(), buffer.len() as u32, 0) };
    if length == 0 || length as usize > buffer.len() {
        return String::new();
    }
    let path = strings::from_utf16(&buffer[..length as usize]);
    path.strip_prefix("\\\\?\\").unwrap_or(&path).to_string()
}

fn quote_argument(argument: &str) -> String {
    if argument.contains(' ') && !argument.starts_with('"') {
        format!("\"{argument}\"")
    } else {
        argument.to_string()
    }
}

// The windows-sys context structs and ours must stay layout-compatible;
// the casts in `thread_context` rely on it.
const _: () = assert!(
    std::mem::size_of::<ThreadContextX86>() == std::mem::size_of::<WOW64_CONTEXT>()
);
const _: () = assert!(std::mem::size_of::<ThreadContextX64>() == std::mem::size_of::<CONTEXT>());
