//! Subnet: a composite component whose body is itself a [`Network`].
//!
//! A subnet's declared ports are bridged to an inner network through a pair
//! of built-in boundary components per port: an `Inlet` forwards packets
//! arriving on an external input port into the matching internal port, an
//! `Outlet` forwards packets leaving a matching internal port out through the
//! external output port. Composites nest arbitrarily — a subnet's inner
//! network may itself register another subnet as a component.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use crate::component::{ComponentBody, ComponentContext, ComponentDescriptor};
use crate::error::{FbpError, Result};
use crate::network::{Network, PortRef, RunOutcome};
use crate::packet::Packet;
use crate::port::{InputPort, OutputPort, PortSpec};

struct Inlet {
    rx: Mutex<Option<flume::Receiver<Packet>>>,
}

#[async_trait]
impl ComponentBody for Inlet {
    async fn run(&self, ctx: &mut ComponentContext) -> Result<()> {
        let rx = self
            .rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .expect("inlet run more than once");
        while let Ok(packet) = rx.recv_async().await {
            let packet = ctx.adopt(packet);
            ctx.send("OUT", packet).await?;
        }
        Ok(())
    }
}

struct Outlet {
    tx: Mutex<Option<flume::Sender<Packet>>>,
}

#[async_trait]
impl ComponentBody for Outlet {
    async fn run(&self, ctx: &mut ComponentContext) -> Result<()> {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .expect("outlet run more than once");
        let mut iter = ctx.input("IN")?.iter_packets();
        while let Some(packet) = iter.next().await {
            if tx.send_async(packet).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

/// Declares one external input port on a subnet and the internal
/// `component.port` it forwards into.
pub struct BoundaryInport {
    pub external: PortSpec,
    pub internal: PortRef,
}

/// Declares one external output port on a subnet and the internal
/// `component.port` it is fed from.
pub struct BoundaryOutport {
    pub external: PortSpec,
    pub internal: PortRef,
}

type BridgeFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// A [`Network`] wrapped as a [`ComponentBody`].
///
/// Built from an inner network that already declares and connects its real
/// components; [`Subnet::new`] adds one `Inlet`/`Outlet` boundary component
/// per declared external port and wires it to the named internal port.
pub struct Subnet {
    descriptor: ComponentDescriptor,
    network: Mutex<Option<Network>>,
    input_bridges: Vec<flume::Sender<Packet>>,
    output_bridges: Vec<flume::Receiver<Packet>>,
    input_names: Vec<String>,
    output_names: Vec<String>,
}

impl Subnet {
    /// # Errors
    ///
    /// Propagates any [`FbpError`] from registering the boundary components
    /// or wiring them to `internal` on the inner network (e.g. an unknown
    /// internal port, or a duplicate connection into a single-valued port).
    pub fn new(
        kind: impl Into<String>,
        mut network: Network,
        inputs: Vec<BoundaryInport>,
        outputs: Vec<BoundaryOutport>,
    ) -> Result<Self> {
        let mut descriptor = ComponentDescriptor::new(kind);
        let mut input_bridges = Vec::with_capacity(inputs.len());
        let mut input_names = Vec::with_capacity(inputs.len());

        for inp in inputs {
            let (tx, rx) = flume::unbounded();
            let inlet_name = format!("__inlet_{}", inp.external.name);
            let inlet_descriptor = ComponentDescriptor::new("__inlet").outport(PortSpec::new("OUT", inp.external.port_type.clone()));
            network.add_component(inlet_name.clone(), inlet_descriptor, Arc::new(Inlet { rx: Mutex::new(Some(rx)) }))?;
            network.connect(PortRef::new(inlet_name, "OUT"), inp.internal, None)?;
            input_names.push(inp.external.name.clone());
            descriptor = descriptor.inport(inp.external);
            input_bridges.push(tx);
        }

        let mut output_bridges = Vec::with_capacity(outputs.len());
        let mut output_names = Vec::with_capacity(outputs.len());

        for outp in outputs {
            let (tx, rx) = flume::unbounded();
            let outlet_name = format!("__outlet_{}", outp.external.name);
            let outlet_descriptor = ComponentDescriptor::new("__outlet").inport(PortSpec::new("IN", outp.external.port_type.clone()));
            network.add_component(outlet_name.clone(), outlet_descriptor, Arc::new(Outlet { tx: Mutex::new(Some(tx)) }))?;
            network.connect(outp.internal, PortRef::new(outlet_name, "IN"), None)?;
            output_names.push(outp.external.name.clone());
            descriptor = descriptor.outport(outp.external);
            output_bridges.push(rx);
        }

        Ok(Self {
            descriptor,
            network: Mutex::new(Some(network)),
            input_bridges,
            output_bridges,
            input_names,
            output_names,
        })
    }

    #[must_use]
    pub fn descriptor(&self) -> ComponentDescriptor {
        self.descriptor.clone()
    }
}

#[async_trait]
impl ComponentBody for Subnet {
    async fn run(&self, ctx: &mut ComponentContext) -> Result<()> {
        let mut network = self
            .network
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| FbpError::component_error(ctx.name(), "subnet run more than once"))?;

        let mut bridges: Vec<BridgeFuture> = Vec::with_capacity(self.input_names.len() + self.output_names.len());

        for (name, tx) in self.input_names.iter().zip(self.input_bridges.iter().cloned()) {
            let mut port: InputPort = ctx.take_input(name)?;
            bridges.push(Box::pin(async move {
                while let Some(packet) = port.receive().await {
                    if tx.send_async(packet).await.is_err() {
                        break;
                    }
                }
                Ok(())
            }));
        }

        for (name, rx) in self.output_names.iter().zip(self.output_bridges.iter().cloned()) {
            let mut port: OutputPort = ctx.take_output(name)?;
            bridges.push(Box::pin(async move {
                while let Ok(packet) = rx.recv_async().await {
                    if port.send(packet).await.is_err() {
                        break;
                    }
                }
                port.close();
                Ok(())
            }));
        }

        let (outcome, _) = futures::join!(network.run(), futures::future::join_all(bridges));

        match outcome? {
            RunOutcome::Quiesced => Ok(()),
            RunOutcome::Cancelled => Err(FbpError::Cancelled),
            RunOutcome::Errored(mut errors) => Err(errors
                .drain(..)
                .next()
                .unwrap_or_else(|| FbpError::component_error(ctx.name(), "inner network errored"))),
            RunOutcome::Deadlocked(suspended) => Err(FbpError::Deadlock(suspended)),
        }
    }
}
