//! The structured event stream emitted during a network run.
//!
//! This is a programmatic channel for external observers (editors, embedding
//! programs); it is separate from, and in addition to, the `tracing` spans
//! emitted for operators.

use std::fmt;

/// One event in the network's lifecycle.
#[derive(Debug, Clone)]
pub enum Event {
    NetworkStarted,
    NetworkTerminated,
    NetworkDeadlocked { suspended: Vec<String> },
    ComponentStarted { component: String },
    ComponentTerminated { component: String },
    ComponentErrored {
        component: String,
        message: String,
        context: String,
    },
    PacketSent { src: String, dst: String, size_hint: Option<usize> },
    PacketReceived { src: String, dst: String },
    ConnectionFull { src: String, dst: String },
    ConnectionDrained { src: String, dst: String },
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NetworkStarted => write!(f, "network started"),
            Self::NetworkTerminated => write!(f, "network terminated"),
            Self::NetworkDeadlocked { suspended } => {
                write!(f, "network deadlocked: {suspended:?}")
            }
            Self::ComponentStarted { component } => write!(f, "{component} started"),
            Self::ComponentTerminated { component } => write!(f, "{component} terminated"),
            Self::ComponentErrored { component, message, .. } => {
                write!(f, "{component} errored: {message}")
            }
            Self::PacketSent { src, dst, .. } => write!(f, "packet sent {src} -> {dst}"),
            Self::PacketReceived { src, dst } => write!(f, "packet received {src} -> {dst}"),
            Self::ConnectionFull { src, dst } => write!(f, "connection full {src} -> {dst}"),
            Self::ConnectionDrained { src, dst } => write!(f, "connection drained {src} -> {dst}"),
        }
    }
}

/// Sending half of the event stream. Exposed so embedders and composite
/// components can forward events from an inner network.
pub type EventSender = flume::Sender<Event>;

/// Receiving half: the handle an external observer subscribes with.
pub type EventStream = flume::Receiver<Event>;

/// Create a fresh, unbounded event channel pair for a `Network`.
///
/// Unbounded because event emission must never itself apply backpressure to
/// the data plane it is reporting on.
#[must_use]
pub fn channel() -> (EventSender, EventStream) {
    flume::unbounded()
}
