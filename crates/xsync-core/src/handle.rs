//! Typed driver object handles
//!
//! Every driver object is addressed through its own handle type. A handle is either a live
//! id issued by the driver or the explicit `Invalid` variant, which negative tests pass to
//! provoke `INVALID_NULL_HANDLE` style failures.

use crate::{Error, Result};
use std::fmt;
use std::num::NonZeroU64;

macro_rules! define_handle {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            Valid(NonZeroU64),
            Invalid,
        }

        impl $name {
            pub(crate) fn from_raw(raw: NonZeroU64) -> Self {
                $name::Valid(raw)
            }

            /// The tagged invalid handle.
            pub const fn invalid() -> Self {
                $name::Invalid
            }

            pub fn is_valid(&self) -> bool {
                matches!(self, $name::Valid(_))
            }

            /// Raw id, or `InvalidHandle` for the invalid variant.
            pub fn raw(&self) -> Result<u64> {
                match self {
                    $name::Valid(raw) => Ok(raw.get()),
                    $name::Invalid => Err(Error::InvalidHandle($label)),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self {
                    $name::Valid(raw) => write!(f, "{}#{}", $label, raw),
                    $name::Invalid => write!(f, "{}#invalid", $label),
                }
            }
        }
    };
}

define_handle!(
    /// Device or sub-device.
    DeviceHandle,
    "device"
);
define_handle!(
    /// Driver context; scope of allocations and command objects.
    ContextHandle,
    "context"
);
define_handle!(
    /// Memory allocation (host, device or shared), local or imported.
    MemoryHandle,
    "memory"
);
define_handle!(CommandListHandle, "command list");
define_handle!(CommandQueueHandle, "command queue");
define_handle!(FenceHandle, "fence");
define_handle!(EventPoolHandle, "event pool");
define_handle!(EventHandle, "event");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_handle_is_rejected() {
        let h = EventHandle::invalid();
        assert!(!h.is_valid());
        assert!(matches!(h.raw(), Err(Error::InvalidHandle("event"))));

        let v = EventHandle::from_raw(NonZeroU64::new(7).unwrap());
        assert!(v.is_valid());
        assert_eq!(v.raw().unwrap(), 7);
        assert_eq!(v.to_string(), "event#7");
    }
}
