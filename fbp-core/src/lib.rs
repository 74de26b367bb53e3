//! FBP Core
//!
//! The execution engine for flow-based programming: a directed graph of
//! cooperatively-scheduled components that communicate exclusively by sending
//! owned packets over bounded, named ports.
//!
//! - Typed, owned packets with bracket roles (`packet`)
//! - Bounded FIFO ports and connections with close semantics and IIP injection (`port`, `connection`)
//! - Components: declared port sets, a user body, and a lifecycle state machine (`component`)
//! - Networks: graph builder, scheduler, termination and deadlock detection, error aggregation (`network`)
//! - Subnets: a network wrapped as a component, with boundary port bridging (`subnet`)
//! - Advisory per-port type checking (`types`)
//! - A structured event stream for external observers (`event`)

#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]

pub mod component;
pub mod connection;
pub mod error;
pub mod event;
pub mod network;
pub mod packet;
pub mod port;
pub mod subnet;
pub mod timeout;
pub mod types;

pub mod prelude {
    pub use crate::component::{
        ComponentBody, ComponentContext, ComponentDescriptor, ComponentState, PortDecl,
    };
    pub use crate::connection::Connection;
    pub use crate::error::{FbpError, Result};
    pub use crate::event::{Event, EventSender, EventStream};
    pub use crate::network::{
        ConnectionSpec, Network, NetworkConfig, NetworkHandle, NetworkStatus, PortRef, RunOutcome,
    };
    pub use crate::packet::{Packet, PacketRole};
    pub use crate::port::{ArrayArity, InputPort, OutputPort, PortSpec};
    pub use crate::subnet::{BoundaryInport, BoundaryOutport, Subnet};
    pub use crate::types::{PortType, Validate};
}
