//! OS memory primitives for code that is generated or patched at runtime.
//!
//! Everything in this module operates on raw process memory and is only as safe as the
//! addresses handed to it. The OS backend is selected at compile time: [`unix`] uses
//! `mmap`/`mprotect`, [`windows`] uses `VirtualAlloc`/`VirtualProtect`.
//!
//! # Key Components
//!
//! - [`Protection`] - Page permission flags, independent of the OS representation
//! - [`RawRegion`] - An anonymous read/write/execute mapping, released on drop
//! - [`WritableScope`] - Temporarily makes a range writable and restores it on drop
//! - [`ExecutableRegion`] - A copy of caller-supplied machine code in read/execute memory
//!
//! # Examples
//!
//! ```rust,no_run
//! use jitscope::memory::ExecutableRegion;
//!
//! // mov eax, 42; ret
//! let region = ExecutableRegion::from_code(&[0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3])?;
//! let answer: extern "C" fn() -> i32 = unsafe { std::mem::transmute(region.address()) };
//! assert_eq!(answer(), 42);
//! # Ok::<(), jitscope::Error>(())
//! ```

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
use unix as os;
#[cfg(windows)]
use windows as os;

use bitflags::bitflags;
use tracing::trace;

use crate::{Error, Result};

bitflags! {
    /// Page permissions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Protection: u32 {
        /// Pages can be read
        const READ = 0x1;
        /// Pages can be written
        const WRITE = 0x2;
        /// Pages can be executed
        const EXECUTE = 0x4;
    }
}

impl Protection {
    /// Read + write
    pub const READ_WRITE: Self = Self::READ.union(Self::WRITE);
    /// Read + execute
    pub const READ_EXECUTE: Self = Self::READ.union(Self::EXECUTE);
    /// Read + write + execute
    pub const READ_WRITE_EXECUTE: Self = Self::READ_WRITE.union(Self::EXECUTE);
}

/// Size of a memory page in bytes.
#[must_use]
pub fn page_size() -> usize {
    os::page_size()
}

/// Rounds `[address, address + len)` out to whole pages.
fn page_span(address: usize, len: usize) -> (usize, usize) {
    let page = page_size();
    let start = address & !(page - 1);
    let end = (address + len.max(1) + page - 1) & !(page - 1);
    (start, end - start)
}

/// Changes the protection of every page overlapping `[address, address + len)`.
///
/// # Returns
///
/// The protection the first page had before the change, if the OS reports it. Linux answers
/// through `/proc/self/maps`; other Unix systems return `None`.
///
/// # Errors
/// Returns [`crate::Error::MemoryProtectionFailed`] if the OS rejects the change.
///
/// # Safety
/// Removing permissions from memory that other code is using will fault that code.
pub unsafe fn protect(address: usize, len: usize, protection: Protection) -> Result<Option<Protection>> {
    let (start, span) = page_span(address, len);
    let previous = os::protect(start, span, protection).map_err(|source| {
        Error::MemoryProtectionFailed {
            address,
            len,
            source,
        }
    })?;

    trace!(
        address = format_args!("0x{start:x}"),
        span,
        ?protection,
        ?previous,
        "changed page protection"
    );
    Ok(previous)
}

/// Current protection of the page holding `address`, if the OS exposes it.
#[must_use]
pub fn query(address: usize) -> Option<Protection> {
    os::query(address)
}

/// Makes freshly written code at `[address, address + len)` visible to instruction fetch.
///
/// A no-op on x86, where the instruction cache is coherent with data writes.
pub fn flush_instruction_cache(address: usize, len: usize) {
    os::flush_instruction_cache(address, len);
}

/// An anonymous mapping with read, write and execute permission.
///
/// Trampolines live in these. The mapping is released when the value is dropped.
pub struct RawRegion {
    ptr: *mut u8,
    len: usize,
}

// The region is plain memory owned by this value; nothing in it is thread-affine.
unsafe impl Send for RawRegion {}
unsafe impl Sync for RawRegion {}

impl RawRegion {
    /// Allocates at least `len` bytes of read/write/execute memory.
    ///
    /// # Errors
    /// Returns [`crate::Error::AllocationFailed`] if the OS refuses the mapping.
    pub fn allocate(len: usize) -> Result<Self> {
        let size = len.max(1);
        let ptr = os::allocate(size).map_err(|source| Error::AllocationFailed { size, source })?;
        Ok(RawRegion { ptr, len: size })
    }

    /// Start of the region.
    #[must_use]
    pub fn address(&self) -> usize {
        self.ptr as usize
    }

    /// Usable length of the region.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always `false`; a region holds at least one byte.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies `code` into the start of the region and flushes the instruction cache.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if `code` does not fit.
    pub fn write(&mut self, code: &[u8]) -> Result<()> {
        if code.len() > self.len {
            return Err(Error::OutOfBounds);
        }

        os::write_code(self.ptr, code);
        flush_instruction_cache(self.address(), code.len());
        Ok(())
    }
}

impl Drop for RawRegion {
    fn drop(&mut self) {
        if let Err(error) = os::release(self.ptr, self.len) {
            tracing::warn!(
                address = format_args!("0x{:x}", self.address()),
                %error,
                "failed to release executable region"
            );
        }
    }
}

/// Keeps a memory range writable for the lifetime of the value.
///
/// On creation the pages are made writable while keeping whatever read/execute permission
/// they had, since other threads may be executing code on the same page. On drop the
/// previous protection is restored; when the OS cannot report it the pages stay writable.
pub struct WritableScope {
    address: usize,
    len: usize,
    previous: Option<Protection>,
}

impl WritableScope {
    /// Makes `[address, address + len)` writable.
    ///
    /// # Errors
    /// Returns [`crate::Error::MemoryProtectionFailed`] if the pages cannot be unprotected.
    ///
    /// # Safety
    /// `address` must point into mapped memory of this process.
    pub unsafe fn new(address: usize, len: usize) -> Result<Self> {
        let previous = query(address);
        let wanted = match previous {
            Some(current) => current | Protection::READ_WRITE,
            None => Protection::READ_WRITE_EXECUTE,
        };

        if previous != Some(wanted) {
            protect(address, len, wanted)?;
        }

        Ok(WritableScope {
            address,
            len,
            previous,
        })
    }
}

impl Drop for WritableScope {
    fn drop(&mut self) {
        let Some(previous) = self.previous else {
            return;
        };
        if previous.contains(Protection::WRITE) {
            return;
        }

        if let Err(error) = unsafe { protect(self.address, self.len, previous) } {
            tracing::warn!(%error, "failed to restore page protection");
        }
    }
}

/// Caller-supplied machine code copied into read/execute memory.
///
/// Native replacements are installed through this type. The engine retains every region it
/// creates for the lifetime of the process, since the host may call into the code at any time.
pub struct ExecutableRegion {
    map: memmap2::Mmap,
    len: usize,
}

impl ExecutableRegion {
    /// Allocates read/write memory, copies `code` into it and flips it to read/execute.
    ///
    /// # Errors
    /// Returns [`crate::Error::AllocationFailed`] if the mapping cannot be created,
    /// [`crate::Error::MemoryProtectionFailed`] if it cannot be made executable and
    /// [`crate::Error::Malformed`] if `code` is empty.
    pub fn from_code(code: &[u8]) -> Result<Self> {
        if code.is_empty() {
            return Err(malformed_error!("Native code replacement is empty"));
        }

        let mut map = memmap2::MmapMut::map_anon(code.len()).map_err(|source| {
            Error::AllocationFailed {
                size: code.len(),
                source,
            }
        })?;
        map[..code.len()].copy_from_slice(code);

        let address = map.as_ptr() as usize;
        let map = map
            .make_exec()
            .map_err(|source| Error::MemoryProtectionFailed {
                address,
                len: code.len(),
                source,
            })?;
        flush_instruction_cache(address, code.len());

        Ok(ExecutableRegion {
            map,
            len: code.len(),
        })
    }

    /// Entry address of the code.
    #[must_use]
    pub fn address(&self) -> usize {
        self.map.as_ptr() as usize
    }

    /// Number of code bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always `false`; empty code is rejected on creation.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The code bytes.
    #[must_use]
    pub fn code(&self) -> &[u8] {
        &self.map[..self.len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_span_covers_range() {
        let page = page_size();
        assert_eq!(page_span(page + 1, 2), (page, page));
        assert_eq!(page_span(page - 1, 2), (0, page * 2));
        assert_eq!(page_span(page, 0), (page, page));
    }

    #[test]
    fn raw_region_write() {
        let mut region = RawRegion::allocate(16).unwrap();
        region.write(&[0x90, 0x90, 0xC3]).unwrap();

        let written = unsafe { std::slice::from_raw_parts(region.address() as *const u8, 3) };
        assert_eq!(written, &[0x90, 0x90, 0xC3]);
        assert!(region.write(&vec![0u8; region.len() + 1]).is_err());
    }

    #[test]
    fn executable_region_copies_code() {
        let region = ExecutableRegion::from_code(&[0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3]).unwrap();
        assert_eq!(region.len(), 6);
        assert_eq!(region.code(), &[0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3]);
        assert!(ExecutableRegion::from_code(&[]).is_err());
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn executable_region_runs() {
        let region = ExecutableRegion::from_code(&[0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3]).unwrap();
        let answer: extern "C" fn() -> i32 = unsafe { std::mem::transmute(region.address()) };
        assert_eq!(answer(), 42);
    }

    #[test]
    fn writable_scope_allows_patching_code() {
        let region = ExecutableRegion::from_code(&[0x90, 0x90, 0xC3]).unwrap();
        let address = region.address();
        {
            let _scope = unsafe { WritableScope::new(address, 1) }.unwrap();
            unsafe { *(address as *mut u8) = 0xCC };
        }
        assert_eq!(region.code()[0], 0xCC);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn writable_scope_restores_protection() {
        let region = ExecutableRegion::from_code(&[0x90, 0xC3]).unwrap();
        let address = region.address();
        assert_eq!(query(address), Some(Protection::READ_EXECUTE));
        {
            let _scope = unsafe { WritableScope::new(address, 2) }.unwrap();
            assert_eq!(query(address), Some(Protection::READ_WRITE_EXECUTE));
        }
        assert_eq!(query(address), Some(Protection::READ_EXECUTE));
    }
}
