//! Network: the graph builder, scheduler, termination detector, and error
//! aggregator.
//!
//! Build operations (`add_component`, `connect`, `initialize`, ...) are
//! rejected once the network has left the `idle` state. `run` validates the
//! graph, materializes connections and IIPs into wired port handles, spawns
//! one cooperative task per component plus a deadlock detector, and resolves
//! to a [`RunOutcome`] once every component reaches `terminated` or `errored`
//! and every connection queue is empty.

use hashbrown::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use futures::FutureExt;

use crate::component::{Component, ComponentBody, ComponentContext, ComponentDescriptor, ComponentState};
use crate::connection::{self, Connection};
use crate::error::{FbpError, Result};
use crate::event::{self, Event, EventSender, EventStream};
use crate::packet::Packet;
use crate::port::{ArrayArity, InputPort, OutputPort};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A reference to one port, or one array-port slot, for the build surface:
/// `component.port` or `component.port[index]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRef {
    pub component: String,
    pub port: String,
    pub index: Option<usize>,
}

impl PortRef {
    #[must_use]
    pub fn new(component: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            port: port.into(),
            index: None,
        }
    }

    #[must_use]
    pub const fn at(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }

    /// Parse `component.port` or `component.port[index]`.
    ///
    /// # Errors
    ///
    /// Returns [`FbpError::UnknownPort`] if `s` is not of that shape.
    pub fn parse(s: &str) -> Result<Self> {
        let malformed = || FbpError::UnknownPort {
            component: String::new(),
            port: s.to_string(),
        };
        let (head, index) = match s.find('[') {
            Some(open) => {
                let close = s.rfind(']').filter(|&c| c > open).ok_or_else(malformed)?;
                let idx: usize = s[open + 1..close].parse().map_err(|_| malformed())?;
                (&s[..open], Some(idx))
            }
            None => (s, None),
        };
        let mut parts = head.splitn(2, '.');
        let component = parts.next().filter(|s| !s.is_empty()).ok_or_else(malformed)?;
        let port = parts.next().filter(|s| !s.is_empty()).ok_or_else(malformed)?;
        Ok(Self {
            component: component.to_string(),
            port: port.to_string(),
            index,
        })
    }
}

/// A build-time connection between one output port and one input port.
#[derive(Debug, Clone)]
pub struct ConnectionSpec {
    pub src: PortRef,
    pub dst: PortRef,
    pub capacity: usize,
}

struct IipSpec {
    dst: PortRef,
    packet: Packet,
}

/// The network's run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    Idle,
    Running,
    Terminating,
    Terminated,
    Errored,
}

/// Tunable network behavior, mirroring the builder style of a socket options
/// struct: construct with [`NetworkConfig::default`] and chain `with_*` calls.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Default connection capacity when `connect` is called without an
    /// explicit one. Default: [`connection::DEFAULT_CAPACITY`].
    default_capacity: usize,

    /// Deadlock resolution policy.
    ///
    /// - `false` (default): close the connections feeding the deadlocked
    ///   receivers with end-of-stream, letting them drain to natural
    ///   completion. Not recorded as an error.
    /// - `true`: abort with a [`FbpError::Deadlock`] naming the suspended set.
    deadlock_strict: bool,

    /// How often the deadlock detector polls component states and queue
    /// occupancy. Default: 5ms. Smaller values detect deadlock sooner at the
    /// cost of more wake-ups.
    deadlock_poll_interval: Duration,

    /// Grace period `terminate()` allows components to observe cancellation
    /// and return before they'd otherwise be considered hung. Not currently
    /// enforced as a hard abandonment deadline (see `DESIGN.md`); recorded
    /// here so the value is available to embedders that want to apply their
    /// own watchdog.
    cancellation_grace: Duration,

    /// Whether to verify bracket-packet nesting at runtime. Default: `false`
    /// — nesting is left as a component contract, unchecked by the runtime.
    bracket_checking: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            default_capacity: connection::DEFAULT_CAPACITY,
            deadlock_strict: false,
            deadlock_poll_interval: Duration::from_millis(5),
            cancellation_grace: Duration::from_secs(5),
            bracket_checking: false,
        }
    }
}

impl NetworkConfig {
    #[must_use]
    pub fn with_default_capacity(mut self, capacity: usize) -> Self {
        self.default_capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub const fn with_deadlock_strict(mut self, strict: bool) -> Self {
        self.deadlock_strict = strict;
        self
    }

    #[must_use]
    pub const fn with_deadlock_poll_interval(mut self, interval: Duration) -> Self {
        self.deadlock_poll_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_cancellation_grace(mut self, grace: Duration) -> Self {
        self.cancellation_grace = grace;
        self
    }

    #[must_use]
    pub const fn with_bracket_checking(mut self, enabled: bool) -> Self {
        self.bracket_checking = enabled;
        self
    }

    #[must_use]
    pub const fn bracket_checking(&self) -> bool {
        self.bracket_checking
    }
}

/// The terminal result of [`Network::run`].
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// Full quiescence, no errors recorded.
    Quiesced,
    /// One or more components errored; the aggregated list, in the order
    /// they were recorded.
    Errored(Vec<FbpError>),
    /// Deadlock detected under a strict policy; the suspended component set.
    Deadlocked(Vec<String>),
    /// `terminate()` was called before the network reached quiescence on its own.
    Cancelled,
}

/// A cheap, `Clone`-able handle to a [`Network`]'s cancellation and status
/// primitives, independent of the `Network` value itself.
///
/// `run()` takes `&mut self` for its entire duration, so a caller that wants
/// to call `terminate()` from a concurrently-running task must obtain a
/// handle *before* calling `run`, stash it, and use the handle afterward —
/// the handle shares the underlying `Arc`s rather than borrowing `Network`.
#[derive(Clone)]
pub struct NetworkHandle {
    terminated: Arc<AtomicBool>,
    status: Arc<Mutex<NetworkStatus>>,
}

impl NetworkHandle {
    /// Request cancellation: every suspended component is woken at its next
    /// suspension point and observes [`FbpError::Cancelled`].
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn status(&self) -> NetworkStatus {
        *lock(&self.status)
    }
}

/// Graph builder, scheduler, and error aggregator.
pub struct Network {
    components: HashMap<String, Component>,
    order: Vec<String>,
    connections: Vec<ConnectionSpec>,
    iips: Vec<IipSpec>,
    config: NetworkConfig,
    status: Arc<Mutex<NetworkStatus>>,
    errors: Vec<FbpError>,
    event_tx: EventSender,
    event_rx: Option<EventStream>,
    terminated: Arc<AtomicBool>,
}

impl Network {
    #[must_use]
    pub fn new(config: NetworkConfig) -> Self {
        let (event_tx, event_rx) = event::channel();
        Self {
            components: HashMap::new(),
            order: Vec::new(),
            connections: Vec::new(),
            iips: Vec::new(),
            config,
            status: Arc::new(Mutex::new(NetworkStatus::Idle)),
            errors: Vec::new(),
            event_tx,
            event_rx: Some(event_rx),
            terminated: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Take the event stream. May only be called once; subsequent calls
    /// return `None`.
    pub fn events(&mut self) -> Option<EventStream> {
        self.event_rx.take()
    }

    /// A cheap handle usable to `terminate()` this network from another task
    /// while `run()` is in flight. Obtain it before calling `run`.
    #[must_use]
    pub fn handle(&self) -> NetworkHandle {
        NetworkHandle {
            terminated: Arc::clone(&self.terminated),
            status: Arc::clone(&self.status),
        }
    }

    #[must_use]
    pub fn status(&self) -> NetworkStatus {
        *lock(&self.status)
    }

    #[must_use]
    pub fn list_components(&self) -> Vec<String> {
        self.order.clone()
    }

    #[must_use]
    pub fn list_connections(&self) -> Vec<ConnectionSpec> {
        self.connections.clone()
    }

    /// The registered `kind` of instance `name`, if it exists. Used for
    /// graph export.
    #[must_use]
    pub fn component_kind(&self, name: &str) -> Option<String> {
        self.components.get(name).map(|c| c.descriptor.kind.clone())
    }

    /// Destinations carrying an IIP. The packet value itself isn't
    /// recoverable generically once boxed, so graph export can round-trip
    /// placement but not the literal value.
    #[must_use]
    pub fn list_iips(&self) -> Vec<PortRef> {
        self.iips.iter().map(|i| i.dst.clone()).collect()
    }

    /// Describe any registered component of the given `kind`.
    ///
    /// Multiple instances of the same kind are expected to share an
    /// identical descriptor; the first one registered is returned.
    ///
    /// # Errors
    ///
    /// Returns [`FbpError::UnknownComponent`] if no instance of `kind` is registered.
    pub fn describe_component(&self, kind: &str) -> Result<ComponentDescriptor> {
        self.order
            .iter()
            .filter_map(|n| self.components.get(n))
            .find(|c| c.descriptor.kind == kind)
            .map(|c| c.descriptor.clone())
            .ok_or_else(|| FbpError::UnknownComponent(kind.to_string()))
    }

    fn ensure_idle(&self) -> Result<()> {
        if *lock(&self.status) == NetworkStatus::Idle {
            Ok(())
        } else {
            Err(FbpError::NotIdle)
        }
    }

    // ---- build operations ----

    /// # Errors
    ///
    /// [`FbpError::NotIdle`] if the network has started; [`FbpError::ComponentAlreadyExists`]
    /// if `name` is already registered.
    pub fn add_component(
        &mut self,
        name: impl Into<String>,
        descriptor: ComponentDescriptor,
        body: Arc<dyn ComponentBody>,
    ) -> Result<()> {
        self.ensure_idle()?;
        let name = name.into();
        if self.components.contains_key(&name) {
            return Err(FbpError::ComponentAlreadyExists(name));
        }
        self.order.push(name.clone());
        self.components.insert(name.clone(), Component::new(name, descriptor, body));
        Ok(())
    }

    /// # Errors
    ///
    /// [`FbpError::NotIdle`], or [`FbpError::UnknownComponent`] if `name` isn't registered.
    pub fn remove_component(&mut self, name: &str) -> Result<()> {
        self.ensure_idle()?;
        if self.components.remove(name).is_none() {
            return Err(FbpError::UnknownComponent(name.to_string()));
        }
        self.order.retain(|n| n != name);
        self.connections.retain(|c| c.src.component != name && c.dst.component != name);
        self.iips.retain(|i| i.dst.component != name);
        Ok(())
    }

    fn outport_type(&self, r: &PortRef) -> Result<crate::types::PortType> {
        let c = self
            .components
            .get(&r.component)
            .ok_or_else(|| FbpError::UnknownComponent(r.component.clone()))?;
        c.descriptor
            .outports
            .iter()
            .find(|p| p.name == r.port)
            .map(|p| p.port_type.clone())
            .ok_or_else(|| FbpError::UnknownPort {
                component: r.component.clone(),
                port: r.port.clone(),
            })
    }

    fn inport_decl(&self, r: &PortRef) -> Result<crate::port::PortSpec> {
        let c = self
            .components
            .get(&r.component)
            .ok_or_else(|| FbpError::UnknownComponent(r.component.clone()))?;
        c.descriptor
            .inports
            .iter()
            .find(|p| p.name == r.port)
            .cloned()
            .ok_or_else(|| FbpError::UnknownPort {
                component: r.component.clone(),
                port: r.port.clone(),
            })
    }

    fn ensure_dst_unclaimed(&self, dst: &PortRef, decl: &crate::port::PortSpec) -> Result<()> {
        let conflict = if decl.array.is_none() {
            self.connections.iter().any(|c| c.dst.component == dst.component && c.dst.port == dst.port)
                || self.iips.iter().any(|i| i.dst.component == dst.component && i.dst.port == dst.port)
        } else {
            self.connections.iter().any(|c| c.dst == *dst) || self.iips.iter().any(|i| i.dst == *dst)
        };
        if conflict {
            Err(FbpError::DuplicateConnection {
                component: dst.component.clone(),
                port: dst.port.clone(),
            })
        } else {
            Ok(())
        }
    }

    /// # Errors
    ///
    /// [`FbpError::NotIdle`], [`FbpError::UnknownComponent`]/[`FbpError::UnknownPort`] for
    /// either endpoint, [`FbpError::TypeMismatch`] if the declared types disagree, or
    /// [`FbpError::DuplicateConnection`] if `dst` already has a connection or IIP.
    pub fn connect(&mut self, src: PortRef, dst: PortRef, capacity: Option<usize>) -> Result<()> {
        self.ensure_idle()?;
        let src_type = self.outport_type(&src)?;
        let dst_decl = self.inport_decl(&dst)?;
        if !src_type.is_any() && !dst_decl.port_type.is_any() && src_type.name() != dst_decl.port_type.name() {
            return Err(FbpError::TypeMismatch {
                component: dst.component.clone(),
                port: dst.port.clone(),
                expected: dst_decl.port_type.name().to_string(),
                actual: src_type.name().to_string(),
            });
        }
        self.ensure_dst_unclaimed(&dst, &dst_decl)?;
        let fans_out = self.connections.iter().any(|c| c.src.component == src.component && c.src.port == src.port);
        if fans_out && !src_type.is_cloneable() {
            return Err(FbpError::NotCloneable {
                component: src.component.clone(),
                port: src.port.clone(),
            });
        }
        self.connections.push(ConnectionSpec {
            src,
            dst,
            capacity: capacity.unwrap_or(self.config.default_capacity),
        });
        Ok(())
    }

    /// # Errors
    ///
    /// [`FbpError::NotIdle`], or [`FbpError::UnknownPort`] if no matching connection exists.
    pub fn disconnect(&mut self, src: &PortRef, dst: &PortRef) -> Result<()> {
        self.ensure_idle()?;
        let pos = self
            .connections
            .iter()
            .position(|c| &c.src == src && &c.dst == dst)
            .ok_or_else(|| FbpError::UnknownPort {
                component: dst.component.clone(),
                port: dst.port.clone(),
            })?;
        self.connections.remove(pos);
        Ok(())
    }

    /// Attach an initial information packet to `dst`.
    ///
    /// # Errors
    ///
    /// [`FbpError::NotIdle`], [`FbpError::UnknownPort`], [`FbpError::TypeMismatch`] if `T`
    /// doesn't match the declared port type, or [`FbpError::PortAlreadyInitialized`]/
    /// [`FbpError::DuplicateConnection`] if `dst` is already claimed.
    pub fn initialize<T: Send + 'static>(&mut self, dst: PortRef, value: T) -> Result<()> {
        self.ensure_idle()?;
        let decl = self.inport_decl(&dst)?;
        let packet = Packet::new(value);
        if !decl.port_type.is_any() && packet.type_name() != decl.port_type.name() {
            return Err(FbpError::TypeMismatch {
                component: dst.component.clone(),
                port: dst.port.clone(),
                expected: decl.port_type.name().to_string(),
                actual: packet.type_name().to_string(),
            });
        }
        self.ensure_dst_unclaimed(&dst, &decl).map_err(|_| FbpError::PortAlreadyInitialized {
            component: dst.component.clone(),
            port: dst.port.clone(),
        })?;
        self.iips.push(IipSpec { dst, packet });
        Ok(())
    }

    /// # Errors
    ///
    /// [`FbpError::NotIdle`], or [`FbpError::UnknownPort`] if `dst` has no IIP.
    pub fn uninitialize(&mut self, dst: &PortRef) -> Result<()> {
        self.ensure_idle()?;
        let pos = self.iips.iter().position(|i| &i.dst == dst).ok_or_else(|| FbpError::UnknownPort {
            component: dst.component.clone(),
            port: dst.port.clone(),
        })?;
        self.iips.remove(pos);
        Ok(())
    }

    /// Re-index an array port's connections to be contiguous starting at 0,
    /// in their current index order. Freed slots are reused only on explicit
    /// compaction, not automatically.
    ///
    /// # Errors
    ///
    /// [`FbpError::NotIdle`].
    pub fn compact_array_port(&mut self, port: &PortRef) {
        if !lock(&self.status).eq(&NetworkStatus::Idle) {
            return;
        }
        let mut matches: Vec<&mut usize> = self
            .connections
            .iter_mut()
            .filter(|c| c.dst.component == port.component && c.dst.port == port.port)
            .filter_map(|c| c.dst.index.as_mut())
            .collect();
        matches.sort();
        for (new_idx, idx) in matches.into_iter().enumerate() {
            *idx = new_idx;
        }
    }

    // ---- validation & materialization ----

    fn validate(&self) -> Result<()> {
        for name in &self.order {
            let descriptor = &self.components[name].descriptor;
            for decl in &descriptor.inports {
                let conn_count = self
                    .connections
                    .iter()
                    .filter(|c| c.dst.component == *name && c.dst.port == decl.name)
                    .count();
                let iip_count = self.iips.iter().filter(|i| i.dst.component == *name && i.dst.port == decl.name).count();

                if decl.array.is_none() && conn_count > 0 && iip_count > 0 {
                    return Err(FbpError::PortAlreadyInitialized {
                        component: name.clone(),
                        port: decl.name.clone(),
                    });
                }
                if let Some(ArrayArity::Fixed(max)) = decl.array {
                    if conn_count + iip_count > max {
                        return Err(FbpError::ArityExceeded {
                            component: name.clone(),
                            port: decl.name.clone(),
                            max,
                        });
                    }
                }
                if decl.required && conn_count == 0 && iip_count == 0 {
                    return Err(FbpError::RequiredPortUnconnected {
                        component: name.clone(),
                        port: decl.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Wire every declared port into a fresh [`ComponentContext`] per
    /// component, draining `self.iips` (an IIP is consumable exactly once).
    /// Returns the contexts plus a probe receiver per materialized channel,
    /// used only to observe occupancy for deadlock detection.
    fn materialize(&mut self) -> Result<(HashMap<String, ComponentContext>, Vec<flume::Receiver<Packet>>)> {
        let mut contexts: HashMap<String, ComponentContext> = HashMap::new();
        for name in &self.order {
            let component = self.components.get_mut(name).expect("registered in order");
            contexts.insert(name.clone(), component.new_context(self.config.bracket_checking()));
        }

        let mut probes = Vec::new();
        let event_tx = self.event_tx.clone();
        let mut pending_tx: HashMap<(String, String, Option<usize>), Vec<(String, flume::Sender<Packet>)>> = HashMap::new();

        fn src_label(src: &PortRef) -> String {
            match src.index {
                Some(idx) => format!("{}.{}[{idx}]", src.component, src.port),
                None => format!("{}.{}", src.component, src.port),
            }
        }

        for name in self.order.clone() {
            let descriptor = self.components[&name].descriptor.clone();
            for decl in &descriptor.inports {
                if decl.array.is_none() {
                    let dst = PortRef::new(name.clone(), decl.name.clone());
                    let dst_label = format!("{name}.{}", decl.name);
                    if let Some(spec) = self.connections.iter().find(|c| c.dst == dst).cloned() {
                        let (tx, rx) = Connection::channel(spec.capacity);
                        probes.push(rx.clone());
                        pending_tx
                            .entry((spec.src.component.clone(), spec.src.port.clone(), spec.src.index))
                            .or_default()
                            .push((dst_label, tx));
                        contexts.get_mut(&name).expect("context built above").add_input(InputPort::new(
                            name.clone(),
                            decl.name.clone(),
                            rx,
                            false,
                            event_tx.clone(),
                            src_label(&spec.src),
                        ));
                    } else if let Some(pos) = self.iips.iter().position(|i| i.dst == dst) {
                        let iip = self.iips.remove(pos);
                        let rx = Connection::iip_channel(iip.packet);
                        probes.push(rx.clone());
                        contexts.get_mut(&name).expect("context built above").add_input(InputPort::new(
                            name.clone(),
                            decl.name.clone(),
                            rx,
                            true,
                            event_tx.clone(),
                            "iip",
                        ));
                    } else if decl.required {
                        return Err(FbpError::RequiredPortUnconnected {
                            component: name.clone(),
                            port: decl.name.clone(),
                        });
                    }
                } else {
                    let mut indexed: Vec<(usize, InputPort)> = Vec::new();
                    for spec in self
                        .connections
                        .iter()
                        .filter(|c| c.dst.component == name && c.dst.port == decl.name)
                        .cloned()
                        .collect::<Vec<_>>()
                    {
                        let idx = spec.dst.index.unwrap_or(indexed.len());
                        let (tx, rx) = Connection::channel(spec.capacity);
                        probes.push(rx.clone());
                        let dst_label = format!("{name}.{}[{idx}]", decl.name);
                        pending_tx
                            .entry((spec.src.component.clone(), spec.src.port.clone(), spec.src.index))
                            .or_default()
                            .push((dst_label, tx));
                        indexed.push((
                            idx,
                            InputPort::new(name.clone(), format!("{}[{idx}]", decl.name), rx, false, event_tx.clone(), src_label(&spec.src)),
                        ));
                    }
                    let iip_positions: Vec<usize> = self
                        .iips
                        .iter()
                        .enumerate()
                        .filter(|(_, i)| i.dst.component == name && i.dst.port == decl.name)
                        .map(|(pos, _)| pos)
                        .collect();
                    for pos in iip_positions.into_iter().rev() {
                        let iip = self.iips.remove(pos);
                        let idx = iip.dst.index.unwrap_or(indexed.len());
                        let rx = Connection::iip_channel(iip.packet);
                        probes.push(rx.clone());
                        indexed.push((
                            idx,
                            InputPort::new(name.clone(), format!("{}[{idx}]", decl.name), rx, true, event_tx.clone(), "iip"),
                        ));
                    }
                    indexed.sort_by_key(|(idx, _)| *idx);
                    if decl.required && indexed.is_empty() {
                        return Err(FbpError::RequiredPortUnconnected {
                            component: name.clone(),
                            port: decl.name.clone(),
                        });
                    }
                    if let Some(ArrayArity::Fixed(max)) = decl.array {
                        if indexed.len() > max {
                            return Err(FbpError::ArityExceeded {
                                component: name.clone(),
                                port: decl.name.clone(),
                                max,
                            });
                        }
                    }
                    let ports: Vec<InputPort> = indexed.into_iter().map(|(_, p)| p).collect();
                    contexts.get_mut(&name).expect("context built above").add_input_array(decl.name.clone(), ports);
                }
            }
        }

        for name in self.order.clone() {
            let descriptor = self.components[&name].descriptor.clone();
            for decl in &descriptor.outports {
                if decl.array.is_none() {
                    let key = (name.clone(), decl.name.clone(), None);
                    let mut port = OutputPort::new(name.clone(), decl.name.clone(), decl.port_type.clone(), event_tx.clone());
                    for (dst, tx) in pending_tx.remove(&key).unwrap_or_default() {
                        port.attach(dst, tx);
                    }
                    contexts.get_mut(&name).expect("context built above").add_output(port);
                } else {
                    let mut indices: Vec<usize> = self
                        .connections
                        .iter()
                        .filter(|c| c.src.component == name && c.src.port == decl.name)
                        .filter_map(|c| c.src.index)
                        .collect();
                    indices.sort_unstable();
                    indices.dedup();
                    let mut ports = Vec::with_capacity(indices.len());
                    for idx in indices {
                        let key = (name.clone(), decl.name.clone(), Some(idx));
                        let mut port =
                            OutputPort::new(name.clone(), format!("{}[{idx}]", decl.name), decl.port_type.clone(), event_tx.clone());
                        for (dst, tx) in pending_tx.remove(&key).unwrap_or_default() {
                            port.attach(dst, tx);
                        }
                        ports.push(port);
                    }
                    contexts.get_mut(&name).expect("context built above").add_output_array(decl.name.clone(), ports);
                }
            }
        }

        Ok((contexts, probes))
    }

    // ---- run ----

    /// Run the network to quiescence, deadlock, cancellation, or error.
    ///
    /// # Errors
    ///
    /// Returns [`FbpError::NotIdle`] if the network isn't idle, or a
    /// build-time validation error from the run loop's validate step. All
    /// other failure modes are reported through the returned [`RunOutcome`],
    /// not through `Err`.
    pub async fn run(&mut self) -> Result<RunOutcome> {
        self.ensure_idle()?;
        self.validate()?;

        let (mut contexts, probes) = self.materialize()?;

        *lock(&self.status) = NetworkStatus::Running;
        let _ = self.event_tx.send(Event::NetworkStarted);

        let errors_shared: Arc<Mutex<Vec<FbpError>>> = Arc::new(Mutex::new(Vec::new()));
        let deadlock_report: Arc<Mutex<Option<Vec<String>>>> = Arc::new(Mutex::new(None));

        let mut handles = Vec::with_capacity(self.order.len());
        for name in self.order.clone() {
            let component = self.components.get_mut(&name).expect("registered in order");
            let body = Arc::clone(&component.body);
            let comp_state = Arc::clone(&component.state);
            let net_status = Arc::clone(&self.status);
            let event_tx = self.event_tx.clone();
            let errors = Arc::clone(&errors_shared);
            let mut ctx = contexts.remove(&name).expect("wired above");
            let comp_name = name.clone();

            *lock(&comp_state) = ComponentState::Active;
            let _ = self.event_tx.send(Event::ComponentStarted { component: comp_name.clone() });

            let handle = compio::runtime::spawn(async move {
                let outcome = std::panic::AssertUnwindSafe(body.run(&mut ctx)).catch_unwind().await;
                let mut body_result = outcome.unwrap_or_else(|_| Err(FbpError::component_error(&comp_name, "component panicked")));
                let outstanding = ctx.outstanding();

                if body_result.is_ok() {
                    let unbalanced = ctx.unbalanced_brackets();
                    if !unbalanced.is_empty() {
                        body_result = Err(FbpError::component_error(
                            &comp_name,
                            format!("unterminated open-bracket on port(s): {unbalanced:?}"),
                        ));
                    }
                }

                match &body_result {
                    Ok(()) => {
                        *lock(&comp_state) = ComponentState::Terminated;
                        let _ = event_tx.send(Event::ComponentTerminated { component: comp_name.clone() });
                    }
                    Err(e) => {
                        *lock(&comp_state) = ComponentState::Errored;
                        ctx.close_inputs();
                        ctx.close_outputs();
                        let _ = event_tx.send(Event::ComponentErrored {
                            component: comp_name.clone(),
                            message: e.to_string(),
                            context: String::new(),
                        });
                        {
                            let mut s = lock(&net_status);
                            if *s == NetworkStatus::Running {
                                *s = NetworkStatus::Terminating;
                            }
                        }
                        lock(&errors).push(e.clone());
                    }
                }
                if outstanding != 0 {
                    lock(&errors).push(FbpError::PacketLeak {
                        component: comp_name,
                        outstanding,
                    });
                }
            });
            handles.push(handle);
        }

        let detector_units: Vec<(String, Arc<Mutex<ComponentState>>, Arc<AtomicBool>, Arc<AtomicBool>, flume::Sender<()>)> = self
            .order
            .iter()
            .map(|n| {
                let c = &self.components[n];
                (n.clone(), Arc::clone(&c.state), Arc::clone(&c.hard_cancel), Arc::clone(&c.drain), c.cancel_tx.clone())
            })
            .collect();
        let network_terminated = Arc::clone(&self.terminated);
        let strict = self.config.deadlock_strict;
        let poll_interval = self.config.deadlock_poll_interval;
        let grace_ticks = (self.config.cancellation_grace.as_nanos() / poll_interval.as_nanos().max(1)).max(1) as u32;
        let event_tx = self.event_tx.clone();
        let errors_for_detector = Arc::clone(&errors_shared);
        let deadlock_report_writer = Arc::clone(&deadlock_report);
        let (abandon_tx, abandon_rx) = flume::bounded::<()>(1);

        let detector = compio::runtime::spawn(async move {
            let mut grace_elapsed = 0u32;
            loop {
                compio::time::sleep(poll_interval).await;

                let live: Vec<&(String, Arc<Mutex<ComponentState>>, Arc<AtomicBool>, Arc<AtomicBool>, flume::Sender<()>)> =
                    detector_units
                        .iter()
                        .filter(|(_, state, ..)| !matches!(*lock(state), ComponentState::Terminated | ComponentState::Errored))
                        .collect();

                if live.is_empty() {
                    break;
                }

                if network_terminated.load(Ordering::Relaxed) {
                    for (_, _, hard_cancel, _, tx) in &live {
                        hard_cancel.store(true, Ordering::Relaxed);
                        let _ = tx.try_send(());
                    }
                    grace_elapsed += 1;
                    if grace_elapsed >= grace_ticks {
                        // Components that never suspend again cannot be woken by a
                        // signal alone; give up waiting on them rather than hang
                        // `run()` forever.
                        let _ = abandon_tx.try_send(());
                        break;
                    }
                    continue;
                }

                // Every live component blocked, regardless of which half of a
                // port it's blocked on, is sufficient: with nobody Active, no
                // queue can drain and no suspended-send can ever complete
                // either. This generalizes past the receive-only case to
                // cover mutual full-queue blocking.
                let all_suspended = live
                    .iter()
                    .all(|(_, state, ..)| matches!(*lock(state), ComponentState::SuspendedSend | ComponentState::SuspendedReceive));

                if all_suspended {
                    let names: Vec<String> = live.iter().map(|(n, ..)| n.clone()).collect();
                    let queues_empty = probes.iter().all(flume::Receiver::is_empty);
                    tracing::debug!(suspended = ?names, queues_empty, "deadlock detected");
                    let _ = event_tx.send(Event::NetworkDeadlocked { suspended: names.clone() });
                    for (_, _, hard_cancel, drain, tx) in &live {
                        if strict {
                            hard_cancel.store(true, Ordering::Relaxed);
                        } else {
                            drain.store(true, Ordering::Relaxed);
                        }
                        let _ = tx.try_send(());
                    }
                    if strict {
                        lock(&errors_for_detector).push(FbpError::Deadlock(names.clone()));
                        *lock(&deadlock_report_writer) = Some(names);
                        break;
                    }
                }
            }
        });

        let abandoned = futures::select! {
            () = join_all(handles).map(|_| ()).fuse() => false,
            _ = abandon_rx.recv_async().fuse() => true,
        };
        let _ = detector.await;

        let _ = self.event_tx.send(Event::NetworkTerminated);

        let errors = Arc::try_unwrap(errors_shared).map(|m| m.into_inner().unwrap_or_else(PoisonError::into_inner)).unwrap_or_default();
        let deadlocked = Arc::try_unwrap(deadlock_report).ok().and_then(|m| m.into_inner().unwrap_or_else(PoisonError::into_inner));

        if abandoned {
            let still_live: Vec<String> = self
                .order
                .iter()
                .filter(|n| !matches!(self.components[*n].state(), ComponentState::Terminated | ComponentState::Errored))
                .cloned()
                .collect();
            if !still_live.is_empty() {
                tracing::warn!(components = ?still_live, "abandoned components past cancellation grace period");
            }
        }

        self.errors = errors.clone();

        let outcome = if self.terminated.load(Ordering::Relaxed) {
            RunOutcome::Cancelled
        } else if let Some(names) = deadlocked {
            RunOutcome::Deadlocked(names)
        } else if !errors.is_empty() {
            RunOutcome::Errored(errors)
        } else {
            RunOutcome::Quiesced
        };

        *lock(&self.status) = match &outcome {
            RunOutcome::Quiesced | RunOutcome::Cancelled => NetworkStatus::Terminated,
            RunOutcome::Errored(_) | RunOutcome::Deadlocked(_) => NetworkStatus::Errored,
        };

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PortType;
    use async_trait::async_trait;

    struct Repeat {
        times: usize,
    }

    #[async_trait]
    impl ComponentBody for Repeat {
        async fn run(&self, ctx: &mut ComponentContext) -> Result<()> {
            for i in 0..self.times {
                let p = ctx.create(i as i32);
                ctx.send("OUT", p).await?;
            }
            Ok(())
        }
    }

    struct Sink {
        received: Arc<Mutex<Vec<i32>>>,
    }

    #[async_trait]
    impl ComponentBody for Sink {
        async fn run(&self, ctx: &mut ComponentContext) -> Result<()> {
            while let Some(p) = ctx.recv("IN").await? {
                if let Some(v) = p.get_contents::<i32>() {
                    self.received.lock().unwrap().push(*v);
                }
            }
            Ok(())
        }
    }

    fn descriptor(kind: &str, inports: &[&str], outports: &[&str]) -> ComponentDescriptor {
        let mut d = ComponentDescriptor::new(kind);
        for p in inports {
            d = d.inport(crate::port::PortSpec::new(*p, PortType::of::<i32>()));
        }
        for p in outports {
            d = d.outport(crate::port::PortSpec::new(*p, PortType::of::<i32>()));
        }
        d
    }

    #[test]
    fn simple_pipeline_quiesces_cleanly() {
        let rt = compio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let mut net = Network::new(NetworkConfig::default());
            let received = Arc::new(Mutex::new(Vec::new()));
            net.add_component("A", descriptor("Repeat", &[], &["OUT"]), Arc::new(Repeat { times: 3 }))
                .unwrap();
            net.add_component(
                "B",
                descriptor("Sink", &["IN"], &[]),
                Arc::new(Sink { received: Arc::clone(&received) }),
            )
            .unwrap();
            net.connect(PortRef::new("A", "OUT"), PortRef::new("B", "IN"), None).unwrap();

            let outcome = net.run().await.unwrap();
            assert!(matches!(outcome, RunOutcome::Quiesced));
            assert_eq!(*received.lock().unwrap(), vec![0, 1, 2]);
        });
    }

    #[test]
    fn required_port_unconnected_is_rejected_at_run() {
        let rt = compio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let mut net = Network::new(NetworkConfig::default());
            net.add_component(
                "B",
                descriptor("Sink", &["IN"], &[]),
                Arc::new(Sink { received: Arc::new(Mutex::new(Vec::new())) }),
            )
            .unwrap();
            let err = net.run().await.unwrap_err();
            assert!(matches!(err, FbpError::RequiredPortUnconnected { .. }));
        });
    }

    #[test]
    fn duplicate_connection_into_single_valued_port_is_rejected() {
        let mut net = Network::new(NetworkConfig::default());
        net.add_component("A", descriptor("Repeat", &[], &["OUT"]), Arc::new(Repeat { times: 1 })).unwrap();
        net.add_component("B", descriptor("Sink", &["IN"], &[]), Arc::new(Sink { received: Arc::new(Mutex::new(Vec::new())) }))
            .unwrap();
        net.connect(PortRef::new("A", "OUT"), PortRef::new("B", "IN"), None).unwrap();
        let err = net.connect(PortRef::new("A", "OUT"), PortRef::new("B", "IN"), None).unwrap_err();
        assert!(matches!(err, FbpError::DuplicateConnection { .. }));
    }

    #[test]
    fn build_operations_rejected_once_running() {
        let rt = compio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let mut net = Network::new(NetworkConfig::default());
            net.add_component("A", descriptor("Repeat", &[], &["OUT"]), Arc::new(Repeat { times: 0 })).unwrap();
            net.add_component("B", descriptor("Sink", &["IN"], &[]), Arc::new(Sink { received: Arc::new(Mutex::new(Vec::new())) }))
                .unwrap();
            net.connect(PortRef::new("A", "OUT"), PortRef::new("B", "IN"), None).unwrap();
            let _ = net.run().await.unwrap();
            // after run, network is Terminated (not Idle): build ops reject again.
            let err = net.add_component("C", descriptor("Repeat", &[], &[]), Arc::new(Repeat { times: 0 })).unwrap_err();
            assert!(matches!(err, FbpError::NotIdle));
        });
    }

    #[test]
    fn port_ref_parses_plain_and_array_forms() {
        let plain = PortRef::parse("A.OUT").unwrap();
        assert_eq!(plain, PortRef::new("A", "OUT"));
        let indexed = PortRef::parse("A.OUT[2]").unwrap();
        assert_eq!(indexed, PortRef::new("A", "OUT").at(2));
        assert!(PortRef::parse("garbage").is_err());
    }

    #[test]
    fn fan_out_reaches_every_downstream() {
        let rt = compio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let mut net = Network::new(NetworkConfig::default());
            let out_decl = ComponentDescriptor::new("Repeat")
                .outport(crate::port::PortSpec::new("OUT", PortType::cloneable::<i32>()));
            net.add_component("A", out_decl, Arc::new(Repeat { times: 3 })).unwrap();

            let r1 = Arc::new(Mutex::new(Vec::new()));
            let r2 = Arc::new(Mutex::new(Vec::new()));
            net.add_component(
                "B1",
                descriptor("Sink", &["IN"], &[]),
                Arc::new(Sink { received: Arc::clone(&r1) }),
            )
            .unwrap();
            net.add_component(
                "B2",
                descriptor("Sink", &["IN"], &[]),
                Arc::new(Sink { received: Arc::clone(&r2) }),
            )
            .unwrap();
            net.connect(PortRef::new("A", "OUT"), PortRef::new("B1", "IN"), None).unwrap();
            net.connect(PortRef::new("A", "OUT"), PortRef::new("B2", "IN"), None).unwrap();

            let outcome = net.run().await.unwrap();
            assert!(matches!(outcome, RunOutcome::Quiesced));
            assert_eq!(*r1.lock().unwrap(), vec![0, 1, 2]);
            assert_eq!(*r2.lock().unwrap(), vec![0, 1, 2]);
        });
    }

    #[test]
    fn fan_out_onto_non_cloneable_type_is_rejected_at_connect() {
        let mut net = Network::new(NetworkConfig::default());
        net.add_component("A", descriptor("Repeat", &[], &["OUT"]), Arc::new(Repeat { times: 1 })).unwrap();
        net.add_component("B1", descriptor("Sink", &["IN"], &[]), Arc::new(Sink { received: Arc::new(Mutex::new(Vec::new())) }))
            .unwrap();
        net.add_component("B2", descriptor("Sink", &["IN"], &[]), Arc::new(Sink { received: Arc::new(Mutex::new(Vec::new())) }))
            .unwrap();
        net.connect(PortRef::new("A", "OUT"), PortRef::new("B1", "IN"), None).unwrap();
        let err = net.connect(PortRef::new("A", "OUT"), PortRef::new("B2", "IN"), None).unwrap_err();
        assert!(matches!(err, FbpError::NotCloneable { .. }));
    }
}
