//! # fbp
//!
//! Public surface for the flow-based programming runtime.
//!
//! ## Architecture
//!
//! - **`fbp-core`**: packets, ports, components, the network scheduler
//! - **`fbp`**: this crate — graph description import/export and a
//!   component registry, layered on top of `fbp-core`
//!
//! ## Quick Start
//!
//! ```no_run
//! use fbp::prelude::*;
//! use fbp::registry::ComponentRegistry;
//! use fbp::graph::GraphDescription;
//!
//! # fn load(json: &str, registry: &ComponentRegistry) -> fbp::graph::Result<()> {
//! let description: GraphDescription = serde_json::from_str(json)?;
//! let mut network = description.build(registry, NetworkConfig::default())?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions)]

pub mod graph;
pub mod registry;

pub use fbp_core;

/// Re-exports of `fbp-core`'s prelude plus this crate's own graph and
/// registry types, for `use fbp::prelude::*;`.
pub mod prelude {
    pub use fbp_core::prelude::*;

    pub use crate::graph::{ConnectionEntry, GraphDescription, GraphError, IipEntry, PortAddress};
    pub use crate::registry::{ComponentFactory, ComponentRegistry};
}
