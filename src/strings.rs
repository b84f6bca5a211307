//! UTF-16 conversions and small string helpers shared by the event pump and
//! the binary log. Debuggee paths and wide debug strings travel as UTF-16LE
//! code units on the wire; in memory they are plain `String`s.

/// Encode a string as UTF-16 code units, no terminator.
pub fn to_utf16(s: &str) -> Vec<u16> {
    s.encode_utf16().collect()
}

/// Number of UTF-16 code units `s` encodes to.
pub fn utf16_len(s: &str) -> u64 {
    s.encode_utf16().count() as u64
}

/// Decode UTF-16 code units, replacing unpaired surrogates.
pub fn from_utf16(units: &[u16]) -> String {
    String::from_utf16_lossy(units)
}

/// Trim trailing and leading whitespace and NUL characters from a debug
/// string read out of the debuggee (the announced length includes the NUL).
pub fn trim_debug_string(s: &str) -> &str {
    s.trim_matches(|c: char| c.is_whitespace() || c == '\0')
}

/// A human-readable message for an OS error code, used for RIP events. Off
/// Windows there is no message table to consult and the text stays empty.
#[cfg(windows)]
pub fn os_error_message(code: u32) -> String {
    use windows_sys::Win32::System::Diagnostics::Debug::{
        FormatMessageW, FORMAT_MESSAGE_FROM_SYSTEM, FORMAT_MESSAGE_IGNORE_INSERTS,
    };

    let mut buffer = [0u16; 512];
    // SAFETY: syscall; the buffer length is passed in code units.
    let length = unsafe {
        FormatMessageW(
            FORMAT_MESSAGE_FROM_SYSTEM | FORMAT_MESSAGE_IGNORE_INSERTS,
            std::ptr::null(),
            code,
            0,
            buffer.as_mut_ptr(),
            buffer.len() as u32,
            std::ptr::null(),
        )
    };

    from_utf16(&buffer[..length as usize])
        .trim_end()
        .to_string()
}

#[cfg(not(windows))]
pub fn os_error_message(_code: u32) -> String {
    String::new()
}
