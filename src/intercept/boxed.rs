use std::{ffi::c_void, fmt};

use crate::{host::ValueShape, Result};

/// An opaque reference to a value living in the shim's frame.
///
/// The shim hands every argument and the return slot to the call manager by address. A
/// `BoxedRef` pairs such an address with the shape of the value stored there;
/// [`BoxedRef::get`] and [`BoxedRef::set`] are the unbox and box primitives. Both check that
/// the Rust type has the size of the shape, which catches most type confusion but not all:
/// reading an `f32` from an `i32` slot is allowed.
///
/// A `BoxedRef` is only valid while the intercepted call is in flight.
pub struct BoxedRef {
    address: usize,
    shape: ValueShape,
}

impl BoxedRef {
    /// Wraps the storage at `address`.
    ///
    /// # Safety
    /// `address` must be null or point to storage of `shape` that stays valid for reads and
    /// writes for as long as the reference is used.
    #[must_use]
    pub unsafe fn new(address: *mut c_void, shape: ValueShape) -> Self {
        BoxedRef {
            address: address as usize,
            shape,
        }
    }

    /// Address of the storage.
    #[must_use]
    pub fn address(&self) -> usize {
        self.address
    }

    /// Shape of the stored value.
    #[must_use]
    pub fn shape(&self) -> ValueShape {
        self.shape
    }

    fn check<T>(&self) -> Result<()> {
        if self.address == 0 {
            return Err(malformed_error!("Boxed {:?} value has no storage", self.shape));
        }
        let requested = std::mem::size_of::<T>();
        if requested != self.shape.size() {
            return Err(malformed_error!(
                "Cannot access {:?} value ({} bytes) as {} ({} bytes)",
                self.shape,
                self.shape.size(),
                std::any::type_name::<T>(),
                requested
            ));
        }
        Ok(())
    }

    /// Reads the value as `T`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if `T` does not have the size of the shape or
    /// the reference has no storage.
    pub fn get<T: Copy>(&self) -> Result<T> {
        self.check::<T>()?;
        Ok(unsafe { std::ptr::read_unaligned(self.address as *const T) })
    }

    /// Overwrites the value with `value`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if `T` does not have the size of the shape or
    /// the reference has no storage.
    pub fn set<T: Copy>(&self, value: T) -> Result<()> {
        self.check::<T>()?;
        unsafe { std::ptr::write_unaligned(self.address as *mut T, value) };
        Ok(())
    }
}

impl fmt::Debug for BoxedRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoxedRef")
            .field("address", &format_args!("0x{:x}", self.address))
            .field("shape", &self.shape)
            .finish()
    }
}
