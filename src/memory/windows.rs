//! `VirtualAlloc`/`VirtualProtect` backend.

use std::io;

use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, VirtualProtect, VirtualQuery, MEMORY_BASIC_INFORMATION, MEM_COMMIT,
    MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE,
    PAGE_EXECUTE_WRITECOPY, PAGE_NOACCESS, PAGE_PROTECTION_FLAGS, PAGE_READONLY, PAGE_READWRITE,
    PAGE_WRITECOPY,
};

use super::Protection;

pub(super) fn page_size() -> usize {
    0x1000
}

fn to_native(protection: Protection) -> PAGE_PROTECTION_FLAGS {
    let read = protection.contains(Protection::READ);
    let write = protection.contains(Protection::WRITE);
    let execute = protection.contains(Protection::EXECUTE);

    match (read || write, write, execute) {
        (_, true, true) => PAGE_EXECUTE_READWRITE,
        (true, false, true) => PAGE_EXECUTE_READ,
        (false, false, true) => PAGE_EXECUTE,
        (_, true, false) => PAGE_READWRITE,
        (true, false, false) => PAGE_READONLY,
        (false, false, false) => PAGE_NOACCESS,
    }
}

fn from_native(native: PAGE_PROTECTION_FLAGS) -> Option<Protection> {
    // Guard and caching modifiers live in the upper bits.
    Some(match native & 0xFF {
        PAGE_NOACCESS => Protection::empty(),
        PAGE_READONLY => Protection::READ,
        PAGE_READWRITE | PAGE_WRITECOPY => Protection::READ_WRITE,
        PAGE_EXECUTE => Protection::EXECUTE,
        PAGE_EXECUTE_READ => Protection::READ_EXECUTE,
        PAGE_EXECUTE_READWRITE | PAGE_EXECUTE_WRITECOPY => Protection::READ_WRITE_EXECUTE,
        _ => return None,
    })
}

pub(super) fn allocate(len: usize) -> io::Result<*mut u8> {
    let ptr = unsafe {
        VirtualAlloc(
            std::ptr::null(),
            len,
            MEM_COMMIT | MEM_RESERVE,
            PAGE_EXECUTE_READWRITE,
        ) as *mut u8
    };
    if ptr.is_null() {
        return Err(io::Error::last_os_error());
    }
    Ok(ptr)
}

pub(super) fn release(ptr: *mut u8, _len: usize) -> io::Result<()> {
    if ptr.is_null() {
        return Ok(());
    }

    let ok = unsafe { VirtualFree(ptr as *mut _, 0, MEM_RELEASE) };
    if ok == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(super) fn protect(start: usize, len: usize, protection: Protection) -> io::Result<Option<Protection>> {
    let mut old: PAGE_PROTECTION_FLAGS = 0;
    let ok = unsafe { VirtualProtect(start as *const _, len, to_native(protection), &mut old) };
    if ok == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(from_native(old))
}

pub(super) fn query(address: usize) -> Option<Protection> {
    let mut info: MEMORY_BASIC_INFORMATION = unsafe { std::mem::zeroed() };
    let written = unsafe {
        VirtualQuery(
            address as *const _,
            &mut info,
            std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
        )
    };
    if written == 0 || info.State != MEM_COMMIT {
        return None;
    }
    from_native(info.Protect)
}

pub(super) fn write_code(ptr: *mut u8, code: &[u8]) {
    unsafe { std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len()) };
}

pub(super) fn flush_instruction_cache(address: usize, len: usize) {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        use windows_sys::Win32::System::{
            Diagnostics::Debug::FlushInstructionCache, Threading::GetCurrentProcess,
        };
        FlushInstructionCache(GetCurrentProcess(), address as *const _, len);
    }

    #[cfg(not(target_arch = "aarch64"))]
    let _ = (address, len);
}
