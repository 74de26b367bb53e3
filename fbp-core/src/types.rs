//! Per-port declared type: an advisory contract checked on send.
//!
//! A [`PortType`] names the Rust type a port declares, carries an optional
//! clone capability used for fan-out duplication, and can be downgraded to
//! the distinguished `any` type which disables validation for that port.

use std::any::Any;
use std::fmt;

use crate::packet::Packet;

/// A clone function for a concrete `T: Clone + Send + 'static`, type-erased.
pub type CloneFn = fn(&(dyn Any + Send)) -> Box<dyn Any + Send>;

/// Something a port can declare as its element type.
#[derive(Clone)]
pub struct PortType {
    name: &'static str,
    clone_fn: Option<CloneFn>,
    /// `true` for the distinguished `any` type: disables validation entirely.
    is_any: bool,
}

impl fmt::Debug for PortType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortType")
            .field("name", &self.name)
            .field("cloneable", &self.clone_fn.is_some())
            .field("is_any", &self.is_any)
            .finish()
    }
}

impl PortType {
    /// Declare a port type for `T`, without fan-out clone capability.
    #[must_use]
    pub fn of<T: Send + 'static>() -> Self {
        Self {
            name: std::any::type_name::<T>(),
            clone_fn: None,
            is_any: false,
        }
    }

    /// Declare a port type for `T`, with fan-out clone capability.
    #[must_use]
    pub fn cloneable<T: Clone + Send + 'static>() -> Self {
        Self {
            name: std::any::type_name::<T>(),
            clone_fn: Some(|any| Box::new(any.downcast_ref::<T>().expect("type checked by PortType").clone())),
            is_any: false,
        }
    }

    /// The distinguished `any` type: disables validation for the port.
    #[must_use]
    pub const fn any() -> Self {
        Self {
            name: "any",
            clone_fn: None,
            is_any: true,
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub const fn is_any(&self) -> bool {
        self.is_any
    }

    #[must_use]
    pub const fn is_cloneable(&self) -> bool {
        self.clone_fn.is_some()
    }

    pub(crate) const fn clone_fn(&self) -> Option<CloneFn> {
        self.clone_fn
    }
}

/// Validates a packet's runtime type name against a declared [`PortType`].
pub trait Validate {
    /// Returns `Ok(())` if `packet`'s declared type matches `self`, or if
    /// `self` is the `any` type (validation disabled).
    ///
    /// # Errors
    ///
    /// Returns `Err(actual_type_name)` on mismatch.
    fn validate(&self, packet: &Packet) -> std::result::Result<(), &'static str>;
}

impl Validate for PortType {
    fn validate(&self, packet: &Packet) -> std::result::Result<(), &'static str> {
        if self.is_any || packet.type_name() == self.name {
            Ok(())
        } else {
            Err(packet.type_name())
        }
    }
}
