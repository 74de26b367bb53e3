//! Component: a worker with declared input/output ports, a user body, and a
//! per-activation lifecycle.

use hashbrown::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::{FbpError, Result};
use crate::packet::{Packet, PacketRole};
use crate::port::{InputPort, OutputPort, PortSpec};

/// Static declaration of one port; see [`PortSpec`].
pub type PortDecl = PortSpec;

/// Static metadata attached to a component kind: its declared ports and a
/// documentation string, reified as an explicit descriptor rather than
/// attached via annotations.
#[derive(Clone)]
pub struct ComponentDescriptor {
    pub kind: String,
    pub inports: Vec<PortDecl>,
    pub outports: Vec<PortDecl>,
    pub description: String,
}

impl ComponentDescriptor {
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            inports: Vec::new(),
            outports: Vec::new(),
            description: String::new(),
        }
    }

    #[must_use]
    pub fn inport(mut self, port: PortDecl) -> Self {
        self.inports.push(port);
        self
    }

    #[must_use]
    pub fn outport(mut self, port: PortDecl) -> Self {
        self.outports.push(port);
        self
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// The component lifecycle:
///
/// ```text
///  not-initialized -> active -> { suspended-send | suspended-receive }* -> terminated
///                         \-> errored
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    NotInitialized,
    Active,
    SuspendedSend,
    SuspendedReceive,
    Terminated,
    Errored,
}

/// The user body contract: invoked once per network run with handles to this
/// component's declared ports, via `ctx`.
///
/// Implementors must not retain `ctx`'s port handles or any packet beyond
/// `run`'s return.
#[async_trait]
pub trait ComponentBody: Send + Sync {
    async fn run(&self, ctx: &mut ComponentContext) -> Result<()>;
}

/// A registered component: its declared ports, body, and the shared lifecycle
/// state a [`crate::network::Network`] observes from outside the running task.
///
/// Carries the wake-up plumbing the network uses to unblock a component that
/// is suspended deep inside a port await: `hard_cancel`/`drain` are flags a
/// [`ComponentContext`] consults on wake to decide whether to surface
/// [`FbpError::Cancelled`] or a plain end-of-stream, and `cancel_tx` is the
/// paired sender the network signals to actually wake the pending future (the
/// flags alone cannot do that; see `cancel_rx` on [`ComponentContext`]).
pub struct Component {
    pub name: String,
    pub descriptor: ComponentDescriptor,
    pub body: Arc<dyn ComponentBody>,
    pub(crate) state: Arc<Mutex<ComponentState>>,
    pub(crate) hard_cancel: Arc<AtomicBool>,
    pub(crate) drain: Arc<AtomicBool>,
    pub(crate) cancel_tx: flume::Sender<()>,
    cancel_rx: Option<flume::Receiver<()>>,
}

impl Component {
    pub(crate) fn new(name: impl Into<String>, descriptor: ComponentDescriptor, body: Arc<dyn ComponentBody>) -> Self {
        let (cancel_tx, cancel_rx) = flume::unbounded();
        Self {
            name: name.into(),
            descriptor,
            body,
            state: Arc::new(Mutex::new(ComponentState::NotInitialized)),
            hard_cancel: Arc::new(AtomicBool::new(false)),
            drain: Arc::new(AtomicBool::new(false)),
            cancel_tx,
            cancel_rx: Some(cancel_rx),
        }
    }

    #[must_use]
    pub fn state(&self) -> ComponentState {
        *self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub(crate) fn set_state(&self, state: ComponentState) {
        *self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = state;
    }

    /// Wake this component's current (or next) suspension point without
    /// changing its interpretation: the `hard_cancel`/`drain` flag already set
    /// by the caller decides whether it sees `Cancelled` or end-of-stream.
    pub(crate) fn wake(&self) {
        let _ = self.cancel_tx.try_send(());
    }

    /// Build the per-run [`ComponentContext`] for this component, consuming
    /// the cancellation receiver. Panics if called more than once per
    /// `Component` (one run per registration).
    pub(crate) fn new_context(&mut self, bracket_checking: bool) -> ComponentContext {
        let cancel_rx = self.cancel_rx.take().expect("component context built more than once");
        ComponentContext::new(
            self.name.clone(),
            Arc::clone(&self.hard_cancel),
            Arc::clone(&self.drain),
            cancel_rx,
            Arc::clone(&self.state),
            bracket_checking,
        )
    }
}

/// Per-run instance of a component's wired ports, passed to
/// [`ComponentBody::run`].
///
/// Tracks the component's outstanding-packet count: every packet created via
/// [`ComponentContext::create`] or
/// received via [`ComponentContext::recv`] increments it; every packet handed
/// to [`ComponentContext::send`] or [`ComponentContext::drop_packet`]
/// decrements it. A component that returns with a non-zero count is reported
/// as [`FbpError::PacketLeak`] by the owning [`crate::network::Network`].
pub struct ComponentContext {
    name: String,
    inputs: HashMap<String, InputPort>,
    input_arrays: HashMap<String, Vec<InputPort>>,
    outputs: HashMap<String, OutputPort>,
    output_arrays: HashMap<String, Vec<OutputPort>>,
    outstanding: usize,
    hard_cancel: Arc<AtomicBool>,
    drain: Arc<AtomicBool>,
    cancel_rx: flume::Receiver<()>,
    state: Arc<Mutex<ComponentState>>,
    bracket_checking: bool,
    bracket_depth: HashMap<String, u32>,
}

impl ComponentContext {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: impl Into<String>,
        hard_cancel: Arc<AtomicBool>,
        drain: Arc<AtomicBool>,
        cancel_rx: flume::Receiver<()>,
        state: Arc<Mutex<ComponentState>>,
        bracket_checking: bool,
    ) -> Self {
        Self {
            name: name.into(),
            inputs: HashMap::new(),
            input_arrays: HashMap::new(),
            outputs: HashMap::new(),
            output_arrays: HashMap::new(),
            outstanding: 0,
            hard_cancel,
            drain,
            cancel_rx,
            state,
            bracket_checking,
            bracket_depth: HashMap::new(),
        }
    }

    pub(crate) fn add_input(&mut self, port: InputPort) {
        self.inputs.insert(port.name().to_string(), port);
    }

    pub(crate) fn add_input_array(&mut self, name: impl Into<String>, ports: Vec<InputPort>) {
        self.input_arrays.insert(name.into(), ports);
    }

    pub(crate) fn add_output(&mut self, port: OutputPort) {
        self.outputs.insert(port.name().to_string(), port);
    }

    pub(crate) fn add_output_array(&mut self, name: impl Into<String>, ports: Vec<OutputPort>) {
        self.output_arrays.insert(name.into(), ports);
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    fn mark(&self, state: ComponentState) {
        *self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = state;
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.hard_cancel.load(Ordering::Relaxed)
    }

    pub fn input(&mut self, name: &str) -> Result<&mut InputPort> {
        self.inputs
            .get_mut(name)
            .ok_or_else(|| FbpError::UnknownPort {
                component: self.name.clone(),
                port: name.to_string(),
            })
    }

    pub fn output(&mut self, name: &str) -> Result<&mut OutputPort> {
        self.outputs
            .get_mut(name)
            .ok_or_else(|| FbpError::UnknownPort {
                component: self.name.clone(),
                port: name.to_string(),
            })
    }

    /// Remove and return an owned input port, for code (e.g. a subnet's
    /// boundary bridge) that needs to hold a port independently of `self`'s
    /// borrow so it can be driven from its own concurrent task.
    pub(crate) fn take_input(&mut self, name: &str) -> Result<InputPort> {
        self.inputs.remove(name).ok_or_else(|| FbpError::UnknownPort {
            component: self.name.clone(),
            port: name.to_string(),
        })
    }

    /// See [`ComponentContext::take_input`].
    pub(crate) fn take_output(&mut self, name: &str) -> Result<OutputPort> {
        self.outputs.remove(name).ok_or_else(|| FbpError::UnknownPort {
            component: self.name.clone(),
            port: name.to_string(),
        })
    }

    pub fn input_array(&mut self, name: &str) -> Result<&mut Vec<InputPort>> {
        self.input_arrays
            .get_mut(name)
            .ok_or_else(|| FbpError::UnknownPort {
                component: self.name.clone(),
                port: name.to_string(),
            })
    }

    pub fn output_array(&mut self, name: &str) -> Result<&mut Vec<OutputPort>> {
        self.output_arrays
            .get_mut(name)
            .ok_or_else(|| FbpError::UnknownPort {
                component: self.name.clone(),
                port: name.to_string(),
            })
    }

    /// Create a packet, incrementing the outstanding count. Only reachable
    /// through a `ComponentContext`, so only the owning component can create
    /// packets.
    pub fn create<T: Send + 'static>(&mut self, value: T) -> Packet {
        self.outstanding += 1;
        Packet::new(value)
    }

    /// Adopt a packet created or received by code outside this context (a
    /// subnet's boundary bridge forwarding a packet in from the outer
    /// network), bumping the outstanding count the same way `create`/`recv`
    /// would.
    pub(crate) fn adopt(&mut self, packet: Packet) -> Packet {
        self.outstanding += 1;
        packet
    }

    pub fn open_bracket(&mut self, label: Option<String>) -> Packet {
        self.outstanding += 1;
        Packet::open_bracket(label)
    }

    pub fn close_bracket(&mut self, label: Option<String>) -> Packet {
        self.outstanding += 1;
        Packet::close_bracket(label)
    }

    /// Receive from a named input port, tracking ownership.
    ///
    /// Races the port against the network's cancellation signal so a
    /// suspended receive wakes promptly on `terminate()` or on deadlock
    /// resolution, rather than only at its next poll. A hard cancellation
    /// (explicit `terminate()`, or deadlock under strict policy) surfaces as
    /// [`FbpError::Cancelled`]; a lenient deadlock-drain resolution surfaces
    /// as a plain end-of-stream (`Ok(None)`), matching how the component
    /// would see the connection close in the ordinary case.
    ///
    /// # Errors
    ///
    /// Returns [`FbpError::UnknownPort`] for an undeclared name, or
    /// [`FbpError::Cancelled`] on a hard cancellation.
    pub async fn recv(&mut self, name: &str) -> Result<Option<Packet>> {
        if self.hard_cancel.load(Ordering::Relaxed) {
            return Err(FbpError::Cancelled);
        }
        if self.drain.load(Ordering::Relaxed) {
            return Ok(None);
        }
        self.mark(ComponentState::SuspendedReceive);
        let cancel_rx = self.cancel_rx.clone();
        let port = self.input(name)?;
        use futures::FutureExt;
        let woken = futures::select! {
            p = port.receive().fuse() => Some(p),
            _ = cancel_rx.recv_async().fuse() => None,
        };
        self.mark(ComponentState::Active);
        let got = match woken {
            Some(p) => p,
            None if self.hard_cancel.load(Ordering::Relaxed) => return Err(FbpError::Cancelled),
            None => None,
        };
        if got.is_some() {
            self.outstanding += 1;
        }
        Ok(got)
    }

    /// Send on a named output port. Ownership of `packet` leaves the
    /// component whether or not the send actually reaches a live downstream.
    ///
    /// Races the port against the network's cancellation signal, same as
    /// [`ComponentContext::recv`]; a producer stuck on a full queue is woken
    /// promptly on `terminate()` rather than left blocked until the network
    /// gives up waiting on it.
    ///
    /// # Errors
    ///
    /// Propagates [`FbpError::DownstreamClosed`], [`FbpError::TypeError`],
    /// [`FbpError::NotCloneable`], or [`FbpError::Cancelled`] from the
    /// underlying [`OutputPort::send`].
    pub async fn send(&mut self, name: &str, packet: Packet) -> Result<()> {
        if self.hard_cancel.load(Ordering::Relaxed) {
            self.outstanding = self.outstanding.saturating_sub(1);
            return Err(FbpError::Cancelled);
        }
        if self.bracket_checking {
            if let Err(e) = self.check_bracket(name, &packet) {
                self.outstanding = self.outstanding.saturating_sub(1);
                return Err(e);
            }
        }
        self.mark(ComponentState::SuspendedSend);
        let cancel_rx = self.cancel_rx.clone();
        let port = self.output(name)?;
        use futures::FutureExt;
        let woken = futures::select! {
            r = port.send(packet).fuse() => Some(r),
            _ = cancel_rx.recv_async().fuse() => None,
        };
        self.mark(ComponentState::Active);
        self.outstanding = self.outstanding.saturating_sub(1);
        match woken {
            Some(r) => r,
            None => Err(FbpError::Cancelled),
        }
    }

    /// Track bracket nesting on `name` when `with_bracket_checking(true)` is
    /// set, an optional runtime checker for matched open/close brackets.
    fn check_bracket(&mut self, name: &str, packet: &Packet) -> Result<()> {
        match packet.role() {
            PacketRole::OpenBracket(_) => {
                *self.bracket_depth.entry(name.to_string()).or_insert(0) += 1;
            }
            PacketRole::CloseBracket(_) => {
                let depth = self.bracket_depth.entry(name.to_string()).or_insert(0);
                if *depth == 0 {
                    return Err(FbpError::component_error(
                        &self.name,
                        format!("close-bracket on {name} with no matching open-bracket"),
                    ));
                }
                *depth -= 1;
            }
            PacketRole::Normal => {}
        }
        Ok(())
    }

    /// Output ports left with an unterminated open-bracket at body return,
    /// when bracket checking is enabled. Checked by the network after a
    /// component's body returns `Ok(())`.
    pub(crate) fn unbalanced_brackets(&self) -> Vec<String> {
        if !self.bracket_checking {
            return Vec::new();
        }
        self.bracket_depth
            .iter()
            .filter(|(_, depth)| **depth != 0)
            .map(|(port, _)| port.clone())
            .collect()
    }

    /// Explicitly release ownership of a packet without forwarding it.
    pub fn drop_packet(&mut self, packet: Packet) {
        drop(packet);
        self.outstanding = self.outstanding.saturating_sub(1);
    }

    /// Close every declared output port. Used by the network when this
    /// component errors, to drive downstreams to end-of-stream.
    pub(crate) fn close_outputs(&mut self) {
        for p in self.outputs.values_mut() {
            p.close();
        }
        for arr in self.output_arrays.values_mut() {
            for p in arr {
                p.close();
            }
        }
    }

    /// Close every declared input port. Used by the network when this
    /// component errors, so upstreams observe `DownstreamClosed`.
    pub(crate) fn close_inputs(&mut self) {
        for p in self.inputs.values_mut() {
            p.close();
        }
        for arr in self.input_arrays.values_mut() {
            for p in arr {
                p.close();
            }
        }
    }
}
