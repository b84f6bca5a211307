//! Decoding of the MSVC C++ EH throw descriptor out of a faulted debuggee.
//!
//! Every native MSVC `throw` raises exception `0xE06D7363` with parameter 0
//! set to the throw magic, parameter 1 pointing at the thrown object and
//! parameter 2 at a `ThrowInfo` block. On 64-bit targets the descriptor
//! graph is addressed by 32-bit offsets relative to parameter 3 (the
//! throwing image base); on Wow64 targets the fields are absolute 32-bit
//! virtual addresses. Walking it recovers the catchable-type chain, the
//! throwing image, and for `std::exception`-derived throws the `what()`
//! message.

use crate::event::{MSVC_EH_EXCEPTION, MSVC_EH_MAGIC};
use crate::memory::{MemoryReader, MemoryReaderExt};
use crate::module_collection::ModuleCollection;

/// Demangled marker looked for when deciding whether the thrown object has
/// a readable `what()`.
const STD_EXCEPTION: &str = "std::exception";

/// Cap on the `what()` message read out of the debuggee.
const MAX_WHAT_LENGTH: usize = 1024;

/// Pointer-to-member-data displacement, shared by both layouts.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C, packed(4))]
pub struct Pmd {
    pub mdisp: i32,
    pub pdisp: i32,
    pub vdisp: i32,
}

/// 64-bit `ThrowInfo`; all descriptor references are image-relative.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C, packed(4))]
pub struct ThrowInfo64 {
    pub attributes: u32,
    pub pmfn_unwind: i32,
    pub p_forward_compat: i32,
    pub p_catchable_type_array: i32,
}

/// 64-bit catchable-type record; `p_type` is image-relative.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C, packed(4))]
pub struct CatchableType64 {
    pub properties: u32,
    pub p_type: i32,
    pub this_displacement: Pmd,
    pub size_or_offset: i32,
    pub copy_function: i32,
}

/// 32-bit `ThrowInfo`; references are absolute 32-bit virtual addresses.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C, packed(4))]
pub struct ThrowInfo32 {
    pub attributes: u32,
    pub pmfn_unwind: u32,
    pub p_forward_compat: u32,
    pub p_catchable_type_array: u32,
}

/// 32-bit catchable-type record; `p_type` is an absolute 32-bit VA.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C, packed(4))]
pub struct CatchableType32 {
    pub properties: u32,
    pub p_type: u32,
    pub this_displacement: Pmd,
    pub size_or_offset: i32,
    pub copy_function: u32,
}

/// Fixed head of a 64-bit type descriptor; the decorated name trails it.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C, packed(8))]
pub struct TypeDescriptor64 {
    pub p_vftable: u64,
    pub spare: u64,
}

/// Fixed head of a 32-bit type descriptor.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C, packed(4))]
pub struct TypeDescriptor32 {
    pub p_vftable: u32,
    pub spare: u32,
}

// SAFETY: packed plain-data records read straight out of the debuggee.
unsafe impl plain::Plain for Pmd {}
// SAFETY: as above.
unsafe impl plain::Plain for ThrowInfo64 {}
// SAFETY: as above.
unsafe impl plain::Plain for CatchableType64 {}
// SAFETY: as above.
unsafe impl plain::Plain for ThrowInfo32 {}
// SAFETY: as above.
unsafe impl plain::Plain for CatchableType32 {}
// SAFETY: as above.
unsafe impl plain::Plain for TypeDescriptor64 {}
// SAFETY: as above.
unsafe impl plain::Plain for TypeDescriptor32 {}

const _: () = assert!(std::mem::size_of::<ThrowInfo64>() == 16);
const _: () = assert!(std::mem::size_of::<CatchableType64>() == 28);
const _: () = assert!(std::mem::size_of::<ThrowInfo32>() == 16);
const _: () = assert!(std::mem::size_of::<CatchableType32>() == 28);
const _: () = assert!(std::mem::size_of::<TypeDescriptor64>() == 16);
const _: () = assert!(std::mem::size_of::<TypeDescriptor32>() == 8);

/// What could be recovered from one MSVC throw. Partially decoded blocks
/// keep whatever was read before the first failed remote access.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExceptionRtti {
    /// Demangled catchable-type names, most derived first.
    pub type_names: Vec<String>,
    /// The `what()` text of `std::exception`-derived throws.
    pub message: Option<String>,
    /// Path of the image whose `ThrowInfo` was thrown.
    pub throw_image_path: Option<String>,
}

impl ExceptionRtti {
    /// Decode the throw descriptor referenced by an exception's parameter
    /// block. Returns `None` unless the code is the MSVC EH number and the
    /// first parameter carries the throw magic.
    pub fn decode(
        memory: &dyn MemoryReader,
        modules: &ModuleCollection,
        code: u32,
        parameters: &[u64],
        is_64bit: bool,
    ) -> Option<ExceptionRtti> {
        if code != MSVC_EH_EXCEPTION || parameters.first().copied() != Some(MSVC_EH_MAGIC) {
            return None;
        }

        let mut rtti = ExceptionRtti::default();
        if is_64bit {
            rtti.decode_64(memory, modules, parameters);
        } else {
            rtti.decode_32(memory, modules, parameters);
        }
        Some(rtti)
    }

    fn decode_64(
        &mut self,
        memory: &dyn MemoryReader,
        modules: &ModuleCollection,
        parameters: &[u64],
    ) {
        let exception_object = parameters.get(1).copied().unwrap_or(0);
        let throw_info_address = parameters.get(2).copied().unwrap_or(0);
        let image_base = parameters.get(3).copied().unwrap_or(0);
        let rva = |offset: i32| image_base.wrapping_add(offset as u32 as u64);

        if let Some(module) = modules.module_at_address(throw_info_address) {
            self.throw_image_path = Some(module.path.clone());
        }
        if throw_info_address == 0 {
            return;
        }

        let Ok(throw_info) = memory.read_value::<ThrowInfo64>(throw_info_address) else {
            return;
        };
        if throw_info.p_catchable_type_array == 0 {
            return;
        }
        let type_array = rva(throw_info.p_catchable_type_array);

        let Ok(count) = memory.read_value::<i32>(type_array) else {
            return;
        };

        let mut contains_std_exception = false;
        for i in 0..count.max(0) as u64 {
            let Ok(reference) = memory.read_value::<i32>(type_array + 4 + i * 4) else {
                return;
            };
            if reference == 0 {
                return;
            }
            let Ok(catchable) = memory.read_value::<CatchableType64>(rva(reference)) else {
                return;
            };
            if catchable.p_type == 0 {
                return;
            }
            let descriptor = rva(catchable.p_type);
            if memory.read_value::<TypeDescriptor64>(descriptor).is_err() {
                return;
            }
            let name_address = descriptor + std::mem::size_of::<TypeDescriptor64>() as u64;
            let Ok(decorated) = memory.read_c_string(name_address, 0) else {
                return;
            };
            if decorated.is_empty() {
                return;
            }

            let name = undecorate_type_name(&decorated);
            contains_std_exception = contains_std_exception || name.contains(STD_EXCEPTION);
            self.type_names.push(name);
        }

        if contains_std_exception {
            self.read_what(memory, exception_object + 8, true);
        }
    }

    fn decode_32(
        &mut self,
        memory: &dyn MemoryReader,
        modules: &ModuleCollection,
        parameters: &[u64],
    ) {
        let exception_object = parameters.get(1).copied().unwrap_or(0);
        let throw_info_address = parameters.get(2).copied().unwrap_or(0);

        if let Some(module) = modules.module_at_address(throw_info_address) {
            self.throw_image_path = Some(module.path.clone());
        }
        if throw_info_address == 0 {
            return;
        }

        let Ok(throw_info) = memory.read_value::<ThrowInfo32>(throw_info_address) else {
            return;
        };
        if throw_info.p_catchable_type_array == 0 {
            return;
        }
        let type_array = u64::from(throw_info.p_catchable_type_array);

        let Ok(count) = memory.read_value::<i32>(type_array) else {
            return;
        };

        let mut contains_std_exception = false;
        for i in 0..count.max(0) as u64 {
            let Ok(reference) = memory.read_value::<u32>(type_array + 4 + i * 4) else {
                return;
            };
            if reference == 0 {
                return;
            }
            let Ok(catchable) = memory.read_value::<CatchableType32>(u64::from(reference)) else {
                return;
            };
            if catchable.p_type == 0 {
                return;
            }
            let descriptor = u64::from(catchable.p_type);
            if memory.read_value::<TypeDescriptor32>(descriptor).is_err() {
                return;
            }
            let name_address = descriptor + std::mem::size_of::<TypeDescriptor32>() as u64;
            let Ok(decorated) = memory.read_c_string(name_address, 0) else {
                return;
            };
            if decorated.is_empty() {
                return;
            }

            let name = undecorate_type_name(&decorated);
            contains_std_exception = contains_std_exception || name.contains(STD_EXCEPTION);
            self.type_names.push(name);
        }

        if contains_std_exception {
            self.read_what(memory, exception_object + 4, false);
        }
    }

    /// Interpret the word after the thrown object's vftable pointer as the
    /// `what()` C-string pointer and read it, capped at 1 KiB.
    fn read_what(&mut self, memory: &dyn MemoryReader, pointer_address: u64, is_64bit: bool) {
        let what = if is_64bit {
            memory.read_value::<u64>(pointer_address)
        } else {
            memory.read_value::<u32>(pointer_address).map(u64::from)
        };
        let Ok(what) = what else {
            return;
        };
        if what == 0 {
            return;
        }
        if let Ok(message) = memory.read_c_string(what, MAX_WHAT_LENGTH) {
            if !message.is_empty() {
                self.message = Some(message);
            }
        }
    }
}

/// Turn an MSVC type-descriptor name (`.?AVruntime_error@std@@`) into the
/// `class std::runtime_error` form. Unrecognized shapes come back verbatim,
/// still usable for display.
pub fn undecorate_type_name(decorated: &str) -> String {
    let Some(rest) = decorated.strip_prefix(".?A") else {
        return decorated.to_string();
    };
    let (kind, rest) = if let Some(rest) = rest.strip_prefix("W4") {
        ("enum ", rest)
    } else if let Some(rest) = rest.strip_prefix('V') {
        ("class ", rest)
    } else if let Some(rest) = rest.strip_prefix('U') {
        ("struct ", rest)
    } else if let Some(rest) = rest.strip_prefix('T') {
        ("union ", rest)
    } else {
        return decorated.to_string();
    };

    let Some(path) = rest.strip_suffix("@@") else {
        return decorated.to_string();
    };
    let mut segments: Vec<&str> = path.split('@').collect();
    segments.reverse();
    format!("{kind}{}", segments.join("::"))
}
