//! Hooks on individual slots of runtime-owned function pointer tables.
//!
//! The host exposes its JIT compiler and the compiler's callback interface as C++-style
//! objects: the first word of the object points to a table of function pointers. Replacing
//! one slot of such a table redirects every call the host makes through it.
//!
//! # Key Components
//!
//! - [`VTable`] / [`VTableSlot`] - Addresses of a table and of one of its entries
//! - [`HookRecord`] - An installed hook and the way back to the original function
//! - [`VTableHookManager`] - Installs and removes hooks, one per slot at most
//!
//! # Thread Safety
//!
//! Slot writes are single atomic pointer stores, so host threads calling through the table
//! observe either the old or the new function. All install and remove requests for slots of
//! the same table are serialized under one lock per table.

use std::{
    collections::HashMap,
    ffi::c_void,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::{
    memory::WritableScope,
    trampoline::{Trampoline, TrampolineCodeGenerator},
    Error, Result,
};

/// The base address of a function pointer table.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct VTable(usize);

impl VTable {
    /// A table at a known base address.
    #[must_use]
    pub fn from_base(base: usize) -> Self {
        VTable(base)
    }

    /// The table of an object whose first word is its table pointer.
    ///
    /// # Safety
    /// `instance` must point to a live object with a vtable pointer at offset 0.
    #[must_use]
    pub unsafe fn of_instance(instance: *const c_void) -> Self {
        VTable(*(instance as *const usize))
    }

    /// Base address of the table.
    #[must_use]
    pub fn base(&self) -> usize {
        self.0
    }

    /// The entry at `index`.
    #[must_use]
    pub fn slot(&self, index: usize) -> VTableSlot {
        VTableSlot {
            table: self.0,
            index,
        }
    }

    /// Reads the function pointer stored at `index`.
    ///
    /// # Safety
    /// The table must be readable for at least `index + 1` entries.
    #[must_use]
    pub unsafe fn read(&self, index: usize) -> usize {
        self.slot(index).read()
    }
}

impl fmt::Debug for VTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VTable(0x{:x})", self.0)
    }
}

/// One entry of a function pointer table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VTableSlot {
    table: usize,
    index: usize,
}

impl VTableSlot {
    /// Base address of the owning table.
    #[must_use]
    pub fn table(&self) -> usize {
        self.table
    }

    /// Index of the entry inside its table.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Address of the entry itself.
    #[must_use]
    pub fn address(&self) -> usize {
        self.table + self.index * std::mem::size_of::<usize>()
    }

    /// Reads the function pointer currently stored in the entry.
    ///
    /// # Safety
    /// The entry must be readable.
    #[must_use]
    pub unsafe fn read(&self) -> usize {
        (*(self.address() as *const AtomicUsize)).load(Ordering::Acquire)
    }

    /// Stores `value` with a single atomic write, unprotecting the page around it.
    unsafe fn write(&self, value: usize) -> Result<()> {
        let _scope = WritableScope::new(self.address(), std::mem::size_of::<usize>())?;
        (*(self.address() as *const AtomicUsize)).store(value, Ordering::Release);
        Ok(())
    }
}

/// An installed slot hook.
///
/// Returned by [`VTableHookManager::install`] and handed back to
/// [`VTableHookManager::remove`]. The trampoline to the original function is released once
/// the record has been removed and the last handle to it is dropped.
pub struct HookRecord {
    slot: VTableSlot,
    original: usize,
    replacement: usize,
    trampoline: Trampoline,
    enabled: AtomicBool,
}

impl HookRecord {
    /// The hooked entry.
    #[must_use]
    pub fn slot(&self) -> VTableSlot {
        self.slot
    }

    /// Address callers use to reach the original function.
    #[must_use]
    pub fn original(&self) -> usize {
        self.trampoline.address()
    }

    /// The function pointer the slot held before the hook was installed.
    #[must_use]
    pub fn original_function(&self) -> usize {
        self.original
    }

    /// The function pointer written into the slot.
    #[must_use]
    pub fn replacement(&self) -> usize {
        self.replacement
    }

    /// `false` once the hook has been removed.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
}

impl fmt::Debug for HookRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRecord")
            .field("slot", &format_args!("0x{:x}", self.slot.address()))
            .field("original", &format_args!("0x{:x}", self.original))
            .field("replacement", &format_args!("0x{:x}", self.replacement))
            .field("trampoline", &format_args!("0x{:x}", self.trampoline.address()))
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

type TableHooks = Arc<Mutex<HashMap<usize, Arc<HookRecord>>>>;

/// Installs and removes slot hooks.
///
/// # Examples
///
/// ```rust,no_run
/// use jitscope::vtable::{VTable, VTableHookManager};
///
/// extern "system" fn replacement() {}
///
/// # fn example(table_base: usize) -> jitscope::Result<()> {
/// let manager = VTableHookManager::new()?;
/// let slot = VTable::from_base(table_base).slot(0);
///
/// let record = unsafe { manager.install(slot, replacement as *const () as usize)? };
/// assert!(manager.is_installed(slot));
///
/// unsafe { manager.remove(record)? };
/// assert!(!manager.is_installed(slot));
/// # Ok(())
/// # }
/// ```
pub struct VTableHookManager {
    generator: TrampolineCodeGenerator,
    /// Table base -> (slot index -> record)
    tables: DashMap<usize, TableHooks>,
}

impl VTableHookManager {
    /// A manager emitting trampolines for the current architecture.
    ///
    /// # Errors
    /// Returns [`crate::Error::UnsupportedArchitecture`] on targets without trampolines.
    pub fn new() -> Result<Self> {
        Ok(Self::with_generator(TrampolineCodeGenerator::new()?))
    }

    /// A manager using the given trampoline generator.
    #[must_use]
    pub fn with_generator(generator: TrampolineCodeGenerator) -> Self {
        VTableHookManager {
            generator,
            tables: DashMap::new(),
        }
    }

    fn table(&self, base: usize) -> TableHooks {
        self.tables.entry(base).or_default().clone()
    }

    /// Redirects `slot` to `replacement`.
    ///
    /// # Errors
    /// - [`crate::Error::HookAlreadyInstalled`] if the slot is already hooked
    /// - [`crate::Error::Malformed`] if the slot holds a null pointer
    /// - [`crate::Error::MemoryProtectionFailed`] if the table cannot be made writable
    ///
    /// # Safety
    /// `slot` must address a live function pointer table entry and `replacement` must be a
    /// function with the exact signature of the function it replaces.
    pub unsafe fn install(&self, slot: VTableSlot, replacement: usize) -> Result<Arc<HookRecord>> {
        let table = self.table(slot.table());
        let mut hooks = lock!(table);

        if hooks.contains_key(&slot.index()) {
            return Err(Error::HookAlreadyInstalled {
                slot: slot.address(),
            });
        }

        let original = slot.read();
        if original == 0 {
            return Err(malformed_error!(
                "Slot {} of table 0x{:x} holds a null function pointer",
                slot.index(),
                slot.table()
            ));
        }

        let trampoline = self.generator.emit(original)?;
        slot.write(replacement)?;

        let record = Arc::new(HookRecord {
            slot,
            original,
            replacement,
            trampoline,
            enabled: AtomicBool::new(true),
        });
        hooks.insert(slot.index(), Arc::clone(&record));

        debug!(
            table = format_args!("0x{:x}", slot.table()),
            index = slot.index(),
            original = format_args!("0x{original:x}"),
            replacement = format_args!("0x{replacement:x}"),
            "installed vtable hook"
        );
        Ok(record)
    }

    /// Restores the slot of `record` to its original function.
    ///
    /// # Errors
    /// - [`crate::Error::HookNotFound`] if the record is not the slot's installed hook
    /// - [`crate::Error::MemoryProtectionFailed`] if the table cannot be made writable
    ///
    /// # Safety
    /// The table the record was installed on must still be alive.
    pub unsafe fn remove(&self, record: Arc<HookRecord>) -> Result<()> {
        let slot = record.slot();
        let table = self.table(slot.table());
        let mut hooks = lock!(table);

        match hooks.get(&slot.index()) {
            Some(installed) if Arc::ptr_eq(installed, &record) => {}
            _ => {
                return Err(Error::HookNotFound {
                    slot: slot.address(),
                })
            }
        }

        let current = slot.read();
        if current != record.replacement {
            warn!(
                slot = format_args!("0x{:x}", slot.address()),
                current = format_args!("0x{current:x}"),
                "slot was re-targeted after hooking, restoring original anyway"
            );
        }

        slot.write(record.original)?;
        record.enabled.store(false, Ordering::Release);
        hooks.remove(&slot.index());

        debug!(
            table = format_args!("0x{:x}", slot.table()),
            index = slot.index(),
            "removed vtable hook"
        );
        Ok(())
    }

    /// Returns `true` if a hook is installed on `slot`.
    #[must_use]
    pub fn is_installed(&self, slot: VTableSlot) -> bool {
        self.installed(slot).is_some()
    }

    /// The hook installed on `slot`, if any.
    #[must_use]
    pub fn installed(&self, slot: VTableSlot) -> Option<Arc<HookRecord>> {
        let table = self.tables.get(&slot.table())?.clone();
        let hooks = lock!(table);
        hooks.get(&slot.index()).cloned()
    }

    /// Number of installed hooks across all tables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables
            .iter()
            .map(|entry| lock!(entry.value()).len())
            .sum()
    }

    /// Returns `true` if no hooks are installed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
