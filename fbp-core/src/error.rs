//! FBP error types.
//!
//! Comprehensive error handling for all network, component, port, and packet
//! operations.

use thiserror::Error;

/// Main error type for FBP runtime operations.
#[derive(Error, Debug, Clone)]
pub enum FbpError {
    // ---- build-time errors (raised synchronously from build operations) ----
    /// Referenced a component name that was never registered.
    #[error("unknown component: {0}")]
    UnknownComponent(String),

    /// `add_component` was called with a name already registered in this network.
    #[error("component already exists: {0}")]
    ComponentAlreadyExists(String),

    /// Referenced a port that the component does not declare.
    #[error("unknown port: {component}.{port}")]
    UnknownPort { component: String, port: String },

    /// A connection or IIP's payload type does not match the declared port type.
    #[error("type mismatch on {component}.{port}: expected {expected}, got {actual}")]
    TypeMismatch {
        component: String,
        port: String,
        expected: String,
        actual: String,
    },

    /// A single-valued input port already has an inbound connection or IIP.
    #[error("duplicate connection into {component}.{port}")]
    DuplicateConnection { component: String, port: String },

    /// Attempted to `initialize` a port that already carries an IIP.
    #[error("port already initialized: {component}.{port}")]
    PortAlreadyInitialized { component: String, port: String },

    /// An array port received more packets/connections than its declared arity allows.
    #[error("arity exceeded on {component}.{port}: max {max}")]
    ArityExceeded {
        component: String,
        port: String,
        max: usize,
    },

    /// A required input port has neither a connection nor an IIP at `run`.
    #[error("required port unconnected: {component}.{port}")]
    RequiredPortUnconnected { component: String, port: String },

    /// Build operation attempted after `run` has started.
    #[error("network is not idle, cannot perform build operation")]
    NotIdle,

    /// Fan-out was requested on a port whose declared type has no clone capability.
    #[error("port {component}.{port} is not cloneable, cannot fan out")]
    NotCloneable { component: String, port: String },

    // ---- runtime errors ----
    /// Raised in the producer when `send` targets a closed downstream.
    #[error("downstream closed: {component}.{port}")]
    DownstreamClosed { component: String, port: String },

    /// End-of-stream sentinel surfaced through a `Result`-returning API
    /// (e.g. `receive_once`). Not recorded as a network error; ordinary
    /// `receive()` represents the same condition as `None` instead.
    #[error("upstream closed")]
    UpstreamClosed,

    /// Raised at `send` when the payload fails the output port's type check.
    #[error("type error sending on {component}.{port}: {message}")]
    TypeError {
        component: String,
        port: String,
        message: String,
    },

    /// Scheduler-delivered cancellation signal observed at a suspension point.
    #[error("operation cancelled")]
    Cancelled,

    /// A blocking port operation exceeded its caller-supplied timeout.
    #[error("operation timed out")]
    Timeout,

    /// The user body of a component raised an uncaught failure.
    #[error("component {component} errored: {message}")]
    ComponentError { component: String, message: String },

    /// A component reached `terminated` while still owning packets.
    #[error("packet leak: component {component} holds {outstanding} unreleased packet(s)")]
    PacketLeak { component: String, outstanding: usize },

    /// All live components are suspended on receive with no pending packets anywhere.
    #[error("deadlock detected among components: {0:?}")]
    Deadlock(Vec<String>),
}

/// Result type alias for FBP runtime operations.
pub type Result<T> = std::result::Result<T, FbpError>;

impl FbpError {
    /// Whether this error originates from a build-time (pre-`run`) validation check,
    /// as opposed to a runtime condition observed during a network run.
    #[must_use]
    pub const fn is_build_time(&self) -> bool {
        matches!(
            self,
            Self::UnknownComponent(_)
                | Self::ComponentAlreadyExists(_)
                | Self::UnknownPort { .. }
                | Self::TypeMismatch { .. }
                | Self::DuplicateConnection { .. }
                | Self::PortAlreadyInitialized { .. }
                | Self::ArityExceeded { .. }
                | Self::RequiredPortUnconnected { .. }
                | Self::NotIdle
                | Self::NotCloneable { .. }
        )
    }

    /// Whether this is the end-of-stream-adjacent class of error that a well-behaved
    /// component is expected to tolerate and drain from, rather than treat as fatal.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    #[must_use]
    pub fn component_error(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ComponentError {
            component: component.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn downstream_closed(component: impl Into<String>, port: impl Into<String>) -> Self {
        Self::DownstreamClosed {
            component: component.into(),
            port: port.into(),
        }
    }
}
