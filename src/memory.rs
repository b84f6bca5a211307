//! The remote-read seam between the crash snapshot core and a debuggee.
//!
//! Everything that touches the target address space (the module index's PE
//! probe, the stack-trace disassembly, the RTTI decoder) goes through
//! [`MemoryReader`], so the decoders can be exercised against an in-process
//! byte map just as well as against a live process.

use crate::errors::RemoteReadError;

/// Reads bytes out of the debuggee address space. A read that cannot deliver
/// every requested byte fails; partial data is never returned.
pub trait MemoryReader {
    fn read(&self, address: u64, buffer: &mut [u8]) -> Result<(), RemoteReadError>;
}

/// Typed convenience reads on top of [`MemoryReader`].
pub trait MemoryReaderExt: MemoryReader {
    /// Read one fixed-size plain-data value.
    fn read_value<T: plain::Plain + Copy>(&self, address: u64) -> Result<T, RemoteReadError> {
        fn as_bytes_mut<T>(value: &mut T) -> &mut [u8] {
            // SAFETY: the caller's `Plain` bound means any byte pattern
            // written through this view is a valid value.
            unsafe {
                std::slice::from_raw_parts_mut(
                    (value as *mut T).cast::<u8>(),
                    std::mem::size_of::<T>(),
                )
            }
        }
        // SAFETY: `Plain` types are valid for any byte pattern, including
        // the all-zero initializer overwritten by the read below.
        let mut value: T = unsafe { std::mem::zeroed() };
        self.read(address, as_bytes_mut(&mut value))?;
        Ok(value)
    }

    /// Read a NUL-terminated byte string one byte at a time. A non-zero
    /// `limit` caps the scan; `0` scans until the first unreadable byte.
    fn read_c_string(&self, address: u64, limit: usize) -> Result<String, RemoteReadError> {
        let mut bytes = Vec::new();
        let mut cursor = address;
        loop {
            if limit != 0 && bytes.len() >= limit {
                break;
            }
            let byte: u8 = self.read_value(cursor)?;
            if byte == 0 {
                break;
            }
            bytes.push(byte);
            cursor += 1;
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Read `byte_length` bytes of UTF-16LE text.
    fn read_string_w(&self, address: u64, byte_length: usize) -> Result<String, RemoteReadError> {
        let mut bytes = vec![0u8; byte_length & !1];
        self.read(address, &mut bytes)?;
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Ok(crate::strings::from_utf16(&units))
    }
}

impl<R: MemoryReader + ?Sized> MemoryReaderExt for R {}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// A flat little-endian byte map standing in for a debuggee address
    /// space. Reads spanning a hole fail like a faulted remote page.
    #[derive(Default)]
    pub struct FakeMemory {
        regions: Vec<(u64, Vec<u8>)>,
    }

    impl FakeMemory {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn put(&mut self, address: u64, bytes: impl Into<Vec<u8>>) {
            self.regions.push((address, bytes.into()));
        }

        pub fn put_u32(&mut self, address: u64, value: u32) {
            self.put(address, value.to_le_bytes().to_vec());
        }

        pub fn put_u64(&mut self, address: u64, value: u64) {
            self.put(address, value.to_le_bytes().to_vec());
        }

        pub fn put_c_string(&mut self, address: u64, value: &str) {
            let mut bytes = value.as_bytes().to_vec();
            bytes.push(0);
            self.put(address, bytes);
        }
    }

    impl MemoryReader for FakeMemory {
        fn read(&self, address: u64, buffer: &mut [u8]) -> Result<(), RemoteReadError> {
            'bytes: for (i, slot) in buffer.iter_mut().enumerate() {
                let wanted = address + i as u64;
                // later puts shadow earlier ones
                for (base, bytes) in self.regions.iter().rev() {
                    if wanted >= *base && wanted < *base + bytes.len() as u64 {
                        *slot = bytes[(wanted - *base) as usize];
                        continue 'bytes;
                    }
                }
                return Err(RemoteReadError {
                    address,
                    length: buffer.len(),
                    os_error: 299, // ERROR_PARTIAL_COPY
                });
            }
            Ok(())
        }
    }
}
