//! Graph description: the bit-semantic import/export format for a network.
//!
//! A [`GraphDescription`] is a plain, serde-friendly value — it names
//! components by `kind` string rather than holding live [`ComponentBody`]
//! instances, so it round-trips through JSON independently of any particular
//! Rust component implementation. [`GraphDescription::build`] resolves each
//! `kind` against a [`ComponentRegistry`] to produce a runnable [`Network`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use fbp_core::error::FbpError;
use fbp_core::network::{ConnectionSpec, Network, NetworkConfig, PortRef};

use crate::registry::ComponentRegistry;

/// Errors raised while building a [`Network`] from, or exporting one to, a
/// [`GraphDescription`].
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// A build operation on the underlying network failed (unknown port,
    /// type mismatch, duplicate connection, and so on).
    #[error(transparent)]
    Fbp(#[from] FbpError),

    /// An `iip` entry's `value` doesn't fit any scalar type this loader
    /// knows how to decode for the destination port's declared type.
    #[error("iip at {component}.{port} declares unsupported value type for {declared}")]
    UnsupportedIipValue { component: String, port: String, declared: &'static str },
}

/// Result alias for graph operations.
pub type Result<T> = std::result::Result<T, GraphError>;

/// One entry in a graph description's `components` map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentEntry {
    /// The registered kind to instantiate via a [`ComponentRegistry`].
    pub kind: String,
    /// Opaque, editor-owned metadata (position, label, ...); not
    /// interpreted by the runtime.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// A `component.port` or `component.port[index]` reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortAddress {
    /// Component instance name.
    pub component: String,
    /// Port name declared on that component's kind.
    pub port: String,
    /// Array-port slot, if any.
    #[serde(default)]
    pub index: Option<usize>,
}

impl From<PortAddress> for PortRef {
    fn from(addr: PortAddress) -> Self {
        match addr.index {
            Some(i) => Self::new(addr.component, addr.port).at(i),
            None => Self::new(addr.component, addr.port),
        }
    }
}

impl From<PortRef> for PortAddress {
    fn from(r: PortRef) -> Self {
        Self {
            component: r.component,
            port: r.port,
            index: r.index,
        }
    }
}

/// One entry in a graph description's `connections` list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionEntry {
    /// Upstream output port.
    pub src: PortAddress,
    /// Downstream input port.
    pub tgt: PortAddress,
    /// Connection queue depth; falls back to the network's default.
    #[serde(default)]
    pub capacity: Option<usize>,
}

/// One entry in a graph description's `iips` list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IipEntry {
    /// The input port the packet is attached to.
    pub tgt: PortAddress,
    /// The packet's value, decoded against the destination port's declared
    /// type (see [`GraphDescription::build`]).
    pub value: serde_json::Value,
    /// Advisory type name; informational only, not checked against `value`.
    #[serde(default)]
    pub r#type: Option<String>,
}

/// A boundary port declaration, for composite (subnet) graphs:
/// an external port name mapped to the internal `component.port` it feeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundaryPort {
    /// Internal port this external port forwards to (inports) or from
    /// (outports).
    pub internal: PortAddress,
}

/// A complete graph: components, connections, boundary ports, and IIPs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphDescription {
    /// Instance name to its registered kind and metadata.
    pub components: BTreeMap<String, ComponentEntry>,
    /// The connection edges.
    #[serde(default)]
    pub connections: Vec<ConnectionEntry>,
    /// External input ports, for composites.
    #[serde(default)]
    pub inports: BTreeMap<String, BoundaryPort>,
    /// External output ports, for composites.
    #[serde(default)]
    pub outports: BTreeMap<String, BoundaryPort>,
    /// Initial information packets.
    #[serde(default)]
    pub iips: Vec<IipEntry>,
}

impl GraphDescription {
    /// Resolve every `kind` against `registry` and produce a runnable,
    /// fully-wired [`Network`] with `config`.
    ///
    /// `inports`/`outports` are recorded for the caller to build a
    /// [`fbp_core::subnet::Subnet`] around the result; they are not
    /// otherwise interpreted here.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::Fbp`] if a `kind` is unregistered or any build
    /// operation (connect, initialize) is rejected, or
    /// [`GraphError::UnsupportedIipValue`] if an IIP's `value` can't be
    /// decoded into the destination port's declared scalar type.
    pub fn build(&self, registry: &ComponentRegistry, config: NetworkConfig) -> Result<Network> {
        let mut network = Network::new(config);

        for (name, entry) in &self.components {
            tracing::debug!(component = %name, kind = %entry.kind, "instantiating component from graph description");
            let (descriptor, body) = registry.instantiate(&entry.kind)?;
            network.add_component(name.clone(), descriptor, body)?;
        }

        for conn in &self.connections {
            tracing::trace!(src = ?conn.src, tgt = ?conn.tgt, "wiring connection from graph description");
            network.connect(conn.src.clone().into(), conn.tgt.clone().into(), conn.capacity)?;
        }

        for iip in &self.iips {
            self.attach_iip(&mut network, iip)?;
        }

        tracing::info!(components = self.components.len(), connections = self.connections.len(), "graph description built into network");
        Ok(network)
    }

    fn attach_iip(&self, network: &mut Network, iip: &IipEntry) -> Result<()> {
        let dst: PortRef = iip.tgt.clone().into();
        let declared = self.components.get(&dst.component).map(|e| e.kind.clone()).unwrap_or_default();

        macro_rules! try_scalar {
            ($ty:ty, $extract:expr) => {
                if let Some(v) = $extract(&iip.value) {
                    network.initialize::<$ty>(dst.clone(), v)?;
                    return Ok(());
                }
            };
        }

        if iip.value.is_string() {
            try_scalar!(String, |v: &serde_json::Value| v.as_str().map(str::to_owned));
        } else if iip.value.is_boolean() {
            try_scalar!(bool, serde_json::Value::as_bool);
        } else if iip.value.is_i64() || iip.value.is_u64() {
            try_scalar!(i64, serde_json::Value::as_i64);
        } else if iip.value.is_f64() {
            try_scalar!(f64, serde_json::Value::as_f64);
        }

        // Fall back to the untyped JSON value itself, for ports declared
        // `PortType::of::<serde_json::Value>()` or `PortType::any()`.
        network.initialize::<serde_json::Value>(dst.clone(), iip.value.clone()).map_err(|e| match e {
            FbpError::TypeMismatch { component, port, .. } => GraphError::UnsupportedIipValue {
                component,
                port,
                declared: type_name_leak(declared),
            },
            other => GraphError::Fbp(other),
        })
    }

    /// Export the live state of `network` back into a graph description.
    ///
    /// IIP placement round-trips; the literal packet value does not, since
    /// a dispatched packet's payload is no longer available once boxed
    /// inside the runtime. Exported `iips` entries carry a `null` value.
    #[must_use]
    pub fn export(network: &Network) -> Self {
        let mut components = BTreeMap::new();
        for name in network.list_components() {
            if let Some(kind) = network.component_kind(&name) {
                components.insert(name, ComponentEntry { kind, metadata: serde_json::Value::Null });
            }
        }

        let connections = network
            .list_connections()
            .into_iter()
            .map(|ConnectionSpec { src, dst, capacity }| ConnectionEntry {
                src: src.into(),
                tgt: dst.into(),
                capacity: Some(capacity),
            })
            .collect();

        let iips = network
            .list_iips()
            .into_iter()
            .map(|dst| IipEntry { tgt: dst.into(), value: serde_json::Value::Null, r#type: None })
            .collect();

        Self { components, connections, inports: BTreeMap::new(), outports: BTreeMap::new(), iips }
    }
}

fn type_name_leak(kind: String) -> &'static str {
    Box::leak(kind.into_boxed_str())
}
