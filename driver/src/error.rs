//! # Error Types
//!
//! All operations of the coordination layer fail with one flat error type.
//! Every variant is a local, synchronous, recoverable condition reported to
//! the immediate caller; nothing here ever aborts the interrupt path.

/// Errors returned by the device-coordination layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// No device with the given id is registered.
    DeviceNotFound,
    /// The handle is not open on this device.
    HandleNotFound,
    /// The register space index does not resolve on this device.
    SpaceNotFound,
    /// A state-changing operation was attempted while another handle holds
    /// exclusive access, or a view was requested without holding it.
    AccessDenied,
    /// The operation conflicts with the device's current state, for example
    /// re-enabling interrupts with a different queue capacity, resetting
    /// while interrupt delivery is enabled, or retiring a device that is
    /// still in use.
    Busy,
    /// The transfer starts at an offset that is not a register.
    UnmappedAddress,
    /// The transfer starts at a register that does not support the
    /// requested direction.
    WrongDirection,
    /// The space lock was contended during an interrupt-path probe.
    Contended,
    /// The handle has no active mapped view to tear down.
    NoView,
    /// The handle still has active mapped views and cannot close.
    ViewsActive,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::DeviceNotFound => write!(f, "Device not registered"),
            Error::HandleNotFound => write!(f, "Handle not open"),
            Error::SpaceNotFound => write!(f, "No such register space"),
            Error::AccessDenied => write!(f, "Exclusive access held elsewhere"),
            Error::Busy => write!(f, "Device state conflicts with the operation"),
            Error::UnmappedAddress => write!(f, "Offset is not a register"),
            Error::WrongDirection => write!(f, "Register does not support the direction"),
            Error::Contended => write!(f, "Space lock contended during probe"),
            Error::NoView => write!(f, "No mapped view to tear down"),
            Error::ViewsActive => write!(f, "Mapped views still active"),
        }
    }
}
