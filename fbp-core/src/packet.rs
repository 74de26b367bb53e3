//! Packet (Information Packet): the typed, owned unit of data flowing between
//! components.
//!
//! A packet's contents are opaque to the runtime; only the producing and
//! consuming components interpret the payload. The runtime only ever inspects
//! a packet's [`PacketRole`] (for substream bracketing) and its declared type
//! name (for the advisory check of [`crate::types`]).

use std::any::Any;
use std::fmt;

/// The role a packet plays with respect to substream grouping.
///
/// Brackets mark the start/end of a logical substream on a connection. The
/// runtime does not enforce nesting by default (see
/// [`crate::network::NetworkConfig::with_bracket_checking`]); it is otherwise a
/// contract between components.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PacketRole {
    #[default]
    Normal,
    OpenBracket(Option<String>),
    CloseBracket(Option<String>),
}

/// A single information packet.
///
/// Contents are type-erased; use [`Packet::get_contents`] or
/// [`Packet::into_contents`] with the type the producing port declared.
pub struct Packet {
    contents: Box<dyn Any + Send>,
    type_name: &'static str,
    role: PacketRole,
}

impl Packet {
    /// Create a normal packet carrying `value`.
    ///
    /// Only code holding an [`crate::port::OutputPort`] handle can reach this
    /// through [`crate::port::OutputPort::send`] in ordinary use; it is public
    /// so tests and [`crate::component::ComponentContext`] can construct
    /// packets directly.
    #[must_use]
    pub fn new<T: Send + 'static>(value: T) -> Self {
        Self {
            contents: Box::new(value),
            type_name: std::any::type_name::<T>(),
            role: PacketRole::Normal,
        }
    }

    /// Create an open-bracket packet. Carries no payload.
    #[must_use]
    pub fn open_bracket(label: Option<String>) -> Self {
        Self {
            contents: Box::new(()),
            type_name: "()",
            role: PacketRole::OpenBracket(label),
        }
    }

    /// Create a close-bracket packet. Carries no payload.
    #[must_use]
    pub fn close_bracket(label: Option<String>) -> Self {
        Self {
            contents: Box::new(()),
            type_name: "()",
            role: PacketRole::CloseBracket(label),
        }
    }

    #[must_use]
    pub fn is_bracket(&self) -> bool {
        !matches!(self.role, PacketRole::Normal)
    }

    #[must_use]
    pub const fn role(&self) -> &PacketRole {
        &self.role
    }

    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Non-destructive read of the packet's contents.
    #[must_use]
    pub fn get_contents<T: 'static>(&self) -> Option<&T> {
        self.contents.downcast_ref::<T>()
    }

    /// Consume the packet, returning its contents if `T` matches, or handing
    /// the packet back unchanged otherwise.
    ///
    /// # Errors
    ///
    /// Returns the original `Packet` if `T` does not match the stored type.
    pub fn into_contents<T: 'static>(self) -> std::result::Result<T, Self> {
        let Self {
            contents,
            type_name,
            role,
        } = self;
        match contents.downcast::<T>() {
            Ok(boxed) => Ok(*boxed),
            Err(contents) => Err(Self {
                contents,
                type_name,
                role,
            }),
        }
    }

    pub(crate) fn clone_with(&self, clone_fn: fn(&(dyn Any + Send)) -> Box<dyn Any + Send>) -> Self {
        Self {
            contents: clone_fn(self.contents.as_ref()),
            type_name: self.type_name,
            role: self.role.clone(),
        }
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("type_name", &self.type_name)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}
