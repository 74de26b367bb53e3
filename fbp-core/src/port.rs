//! Port: a named, typed endpoint on a component, and the in/out handles a
//! running component body uses to move packets.

use crate::error::{FbpError, Result};
use crate::event::{Event, EventSender};
use crate::packet::Packet;
use crate::timeout::with_timeout;
use crate::types::PortType;
use smallvec::SmallVec;
use std::time::Duration;

/// Most output ports have one or two downstream connections; inline storage
/// avoids a heap allocation for the common case.
type Downstream = SmallVec<[(String, flume::Sender<Packet>); 4]>;

/// Array-port arity policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayArity {
    /// Exactly `N` indices, known at declaration time.
    Fixed(usize),
    /// No fixed upper bound; indices are assigned as connections attach.
    Elastic,
    /// Index is whatever the connecting side names; the runtime does not
    /// police contiguity.
    ConnectionIndexed,
}

/// Static declaration of one named port on a component kind.
#[derive(Clone)]
pub struct PortSpec {
    pub name: String,
    pub port_type: PortType,
    pub required: bool,
    pub description: String,
    pub default: Option<&'static str>,
    pub array: Option<ArrayArity>,
}

impl PortSpec {
    #[must_use]
    pub fn new(name: impl Into<String>, port_type: PortType) -> Self {
        Self {
            name: name.into(),
            port_type,
            required: true,
            description: String::new(),
            default: None,
            array: None,
        }
    }

    #[must_use]
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub const fn array(mut self, arity: ArrayArity) -> Self {
        self.array = Some(arity);
        self
    }
}

/// Handle a running component body uses to emit packets on a declared output
/// port.
///
/// Supports fan-out: a port may be attached to more than one downstream
/// connection, in which case every `send` duplicates the packet (requiring
/// the declared [`PortType`] to carry a clone capability).
pub struct OutputPort {
    name: String,
    component: String,
    port_type: PortType,
    downstream: Downstream,
    closed: bool,
    event_tx: EventSender,
}

impl OutputPort {
    #[must_use]
    pub(crate) fn new(component: impl Into<String>, name: impl Into<String>, port_type: PortType, event_tx: EventSender) -> Self {
        Self {
            name: name.into(),
            component: component.into(),
            port_type,
            downstream: SmallVec::new(),
            closed: false,
            event_tx,
        }
    }

    /// Attach a downstream connection, labeled `dst` (`component.port`) for
    /// the event stream.
    pub(crate) fn attach(&mut self, dst: impl Into<String>, tx: flume::Sender<Packet>) {
        self.downstream.push((dst.into(), tx));
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    #[must_use]
    pub fn is_fan_out(&self) -> bool {
        self.downstream.len() > 1
    }

    /// Send a packet, blocking (suspending the component) when every
    /// downstream queue is full.
    ///
    /// On a fan-out port, the packet is duplicated to every downstream
    /// concurrently; a downstream that has disconnected is pruned from the
    /// port's attachment list so later sends don't keep paying for it, but
    /// every still-connected downstream still receives the packet in the
    /// same call.
    ///
    /// # Errors
    ///
    /// - [`FbpError::TypeError`] if `packet`'s type does not match the
    ///   declared port type.
    /// - [`FbpError::DownstreamClosed`] if this port was closed, has no
    ///   attached downstream, or any attached downstream has disconnected.
    /// - [`FbpError::NotCloneable`] if the port fans out to more than one
    ///   downstream but its declared type carries no clone capability.
    pub async fn send(&mut self, packet: Packet) -> Result<()> {
        if self.closed {
            return Err(FbpError::downstream_closed(&self.component, &self.name));
        }
        if self.port_type.validate(&packet).is_err() {
            return Err(FbpError::TypeError {
                component: self.component.clone(),
                port: self.name.clone(),
                message: format!("declared {}, got {}", self.port_type.name(), packet.type_name()),
            });
        }
        if self.downstream.is_empty() {
            return Err(FbpError::downstream_closed(&self.component, &self.name));
        }
        if self.downstream.len() > 1 && !self.port_type.is_cloneable() {
            return Err(FbpError::NotCloneable {
                component: self.component.clone(),
                port: self.name.clone(),
            });
        }

        let src_label = format!("{}.{}", self.component, self.name);
        for (dst, tx) in &self.downstream {
            if tx.is_full() {
                let _ = self.event_tx.send(Event::ConnectionFull { src: src_label.clone(), dst: dst.clone() });
            }
        }

        let fan_out = self.downstream.len();
        let mut packets = Vec::with_capacity(fan_out);
        if fan_out > 1 {
            let clone_fn = self.port_type.clone_fn().expect("checked is_cloneable above");
            for _ in 0..fan_out - 1 {
                packets.push(packet.clone_with(clone_fn));
            }
        }
        packets.push(packet);

        let results = futures::future::join_all(
            self.downstream
                .iter()
                .zip(packets)
                .map(|((_, tx), pkt)| async move { tx.send_async(pkt).await.is_ok() }),
        )
        .await;

        for ((dst, _), ok) in self.downstream.iter().zip(&results) {
            if *ok {
                // Payload size isn't generically known for a type-erased packet.
                let _ = self.event_tx.send(Event::PacketSent { src: src_label.clone(), dst: dst.clone(), size_hint: None });
            }
        }

        let mut kept = Downstream::with_capacity(self.downstream.len());
        let mut all_ok = true;
        for ((dst, tx), ok) in self.downstream.drain(..).zip(results) {
            if ok {
                kept.push((dst, tx));
            } else {
                all_ok = false;
            }
        }
        self.downstream = kept;

        if all_ok {
            Ok(())
        } else {
            Err(FbpError::downstream_closed(&self.component, &self.name))
        }
    }

    /// Producer-side close: idempotent. Detaches all downstream senders,
    /// which drives each downstream connection to `upstream-closed`.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.downstream.clear();
    }
}

/// Handle a running component body uses to consume packets from a declared
/// input port.
pub struct InputPort {
    name: String,
    component: String,
    rx: Option<flume::Receiver<Packet>>,
    closed: bool,
    drop_tolerant: bool,
    event_tx: EventSender,
    /// The upstream side's `component.port` label, or `"iip"` for a port fed
    /// by an initial information packet rather than a connection.
    src_label: String,
}

impl InputPort {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        component: impl Into<String>,
        name: impl Into<String>,
        rx: flume::Receiver<Packet>,
        drop_tolerant: bool,
        event_tx: EventSender,
        src_label: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            component: component.into(),
            rx: Some(rx),
            closed: false,
            drop_tolerant,
            event_tx,
            src_label: src_label.into(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Receive the next packet, suspending the component until one is
    /// available or the connection reaches closed-and-empty, in which case
    /// `None` (end-of-stream) is returned — and will be returned by every
    /// subsequent call.
    pub async fn receive(&mut self) -> Option<Packet> {
        if self.closed {
            return None;
        }
        let got = match &self.rx {
            Some(rx) => rx.recv_async().await.ok(),
            None => None,
        };
        if got.is_some() {
            let dst = format!("{}.{}", self.component, self.name);
            let _ = self.event_tx.send(Event::PacketReceived { src: self.src_label.clone(), dst: dst.clone() });
            if self.rx.as_ref().is_some_and(flume::Receiver::is_empty) {
                let _ = self.event_tx.send(Event::ConnectionDrained { src: self.src_label.clone(), dst });
            }
        }
        got
    }

    /// Receive with an optional timeout. Expiry returns
    /// [`FbpError::Timeout`] without closing the port.
    ///
    /// # Errors
    ///
    /// Returns [`FbpError::Timeout`] if `duration` elapses before a packet
    /// arrives or the port reaches end-of-stream.
    pub async fn receive_timeout(&mut self, duration: Option<Duration>) -> Result<Option<Packet>> {
        with_timeout(duration, self.receive()).await
    }

    /// Read exactly one packet and close the port from the consumer side.
    ///
    /// Intended for parameter-style inputs, typically fed by an IIP.
    ///
    /// # Errors
    ///
    /// Returns [`FbpError::UpstreamClosed`] if the port is already at
    /// end-of-stream with no packet to read.
    pub async fn receive_once(&mut self) -> Result<Packet> {
        let packet = self.receive().await.ok_or(FbpError::UpstreamClosed)?;
        self.close();
        Ok(packet)
    }

    /// Lazily iterate packets until end-of-stream.
    #[must_use]
    pub fn iter_packets(&mut self) -> PacketIter<'_> {
        PacketIter { port: self }
    }

    /// Consumer-side close: idempotent. Any packets already queued are
    /// dropped; a warning is logged unless the port is drop-tolerant.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut dropped = 0usize;
        if let Some(rx) = self.rx.take() {
            while rx.try_recv().is_ok() {
                dropped += 1;
            }
        }
        if dropped > 0 && !self.drop_tolerant {
            tracing::warn!(port = %self.name, dropped, "input port closed with packets still queued");
        }
    }
}

/// Lazy iterator over an [`InputPort`]'s packets, terminating at end-of-stream.
pub struct PacketIter<'a> {
    port: &'a mut InputPort,
}

impl PacketIter<'_> {
    pub async fn next(&mut self) -> Option<Packet> {
        self.port.receive().await
    }

    /// Like [`PacketIter::next`], but downcasts the payload to `T`.
    pub async fn next_contents<T: 'static>(&mut self) -> Option<std::result::Result<T, Packet>> {
        self.port.receive().await.map(Packet::into_contents::<T>)
    }
}
