//! `mmap`/`mprotect` backend.

use std::io;

use super::Protection;

pub(super) fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

fn to_native(protection: Protection) -> libc::c_int {
    let mut native = libc::PROT_NONE;
    if protection.contains(Protection::READ) {
        native |= libc::PROT_READ;
    }
    if protection.contains(Protection::WRITE) {
        native |= libc::PROT_WRITE;
    }
    if protection.contains(Protection::EXECUTE) {
        native |= libc::PROT_EXEC;
    }
    native
}

#[cfg(target_os = "macos")]
const MAP_FLAGS: libc::c_int = libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_JIT;
#[cfg(not(target_os = "macos"))]
const MAP_FLAGS: libc::c_int = libc::MAP_ANON | libc::MAP_PRIVATE;

pub(super) fn allocate(len: usize) -> io::Result<*mut u8> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            MAP_FLAGS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(ptr as *mut u8)
}

pub(super) fn release(ptr: *mut u8, len: usize) -> io::Result<()> {
    if ptr.is_null() {
        return Ok(());
    }

    let rc = unsafe { libc::munmap(ptr as *mut libc::c_void, len) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(super) fn protect(start: usize, len: usize, protection: Protection) -> io::Result<Option<Protection>> {
    let previous = query(start);

    let rc = unsafe { libc::mprotect(start as *mut libc::c_void, len, to_native(protection)) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(previous)
}

/// Reads the permissions of the mapping holding `address` from `/proc/self/maps`.
///
/// Lines look like `7f12a000-7f12b000 r-xp 00000000 00:00 0`.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(super) fn query(address: usize) -> Option<Protection> {
    let maps = std::fs::read_to_string("/proc/self/maps").ok()?;

    maps.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let (start, end) = fields.next()?.split_once('-')?;
        let start = usize::from_str_radix(start, 16).ok()?;
        let end = usize::from_str_radix(end, 16).ok()?;
        if address < start || address >= end {
            return None;
        }

        let perms = fields.next()?.as_bytes();
        let mut protection = Protection::empty();
        if perms.first() == Some(&b'r') {
            protection |= Protection::READ;
        }
        if perms.get(1) == Some(&b'w') {
            protection |= Protection::WRITE;
        }
        if perms.get(2) == Some(&b'x') {
            protection |= Protection::EXECUTE;
        }
        Some(protection)
    })
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(super) fn query(_address: usize) -> Option<Protection> {
    None
}

pub(super) fn write_code(ptr: *mut u8, code: &[u8]) {
    #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
    unsafe {
        let toggle = pthread_jit_write_protect_supported_np() != 0;
        if toggle {
            pthread_jit_write_protect_np(0);
        }
        std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
        if toggle {
            pthread_jit_write_protect_np(1);
        }
    }

    #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
    unsafe {
        std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
    }
}

#[cfg(not(target_arch = "aarch64"))]
pub(super) fn flush_instruction_cache(_address: usize, _len: usize) {}

#[cfg(all(target_arch = "aarch64", target_os = "macos"))]
pub(super) fn flush_instruction_cache(address: usize, len: usize) {
    unsafe { sys_icache_invalidate(address as *mut libc::c_void, len) };
}

#[cfg(all(target_arch = "aarch64", not(target_os = "macos")))]
pub(super) fn flush_instruction_cache(address: usize, len: usize) {
    unsafe {
        __clear_cache(
            address as *mut libc::c_char,
            (address + len) as *mut libc::c_char,
        )
    };
}

#[cfg(all(target_arch = "aarch64", target_os = "macos"))]
extern "C" {
    fn pthread_jit_write_protect_supported_np() -> libc::c_int;
    fn pthread_jit_write_protect_np(enabled: libc::c_int);
    fn sys_icache_invalidate(start: *mut libc::c_void, len: libc::size_t);
}

#[cfg(all(target_arch = "aarch64", not(target_os = "macos")))]
extern "C" {
    fn __clear_cache(begin: *mut libc::c_char, end: *mut libc::c_char);
}
