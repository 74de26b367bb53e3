//! Connection: a bounded FIFO channel between one output port and one input
//! port, plus the one-shot IIP variant.
//!
//! A connection is materialized as a `flume` bounded channel: `flume::bounded`
//! gives exactly the bounded-capacity, close-on-drop, FIFO-ordered channel the
//! base spec's §3 Connection calls for, and its async `send`/`recv` pair gives
//! the suspension points §5 requires, without tying the engine to one async
//! runtime.

use crate::packet::Packet;

/// Default connection capacity when a build operation does not specify one.
pub const DEFAULT_CAPACITY: usize = 10;

/// Factory for the channel pairs that back connections and IIPs.
///
/// `Connection` itself carries no state; it exists to name the construction
/// rules in one place. An IIP is just a pre-loaded connection of capacity 1
/// that closes after delivery.
pub struct Connection;

impl Connection {
    /// Materialize an ordinary connection of the given capacity (minimum 1).
    #[must_use]
    pub fn channel(capacity: usize) -> (flume::Sender<Packet>, flume::Receiver<Packet>) {
        flume::bounded(capacity.max(1))
    }

    /// Materialize a one-shot IIP channel: the packet is queued immediately
    /// and the sending half is dropped, so the receiver observes exactly one
    /// packet followed by end-of-stream.
    #[must_use]
    pub fn iip_channel(value: Packet) -> flume::Receiver<Packet> {
        let (tx, rx) = flume::bounded(1);
        tx.try_send(value)
            .unwrap_or_else(|_| unreachable!("a fresh capacity-1 channel always accepts one send"));
        drop(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iip_channel_yields_one_then_closes() {
        let rx = Connection::iip_channel(Packet::new(42i32));
        let p = rx.try_recv().expect("one packet available");
        assert_eq!(p.get_contents::<i32>(), Some(&42));
        assert!(rx.try_recv().is_err(), "channel must be closed after the single packet");
    }

    #[test]
    fn channel_respects_capacity() {
        let (tx, _rx) = Connection::channel(2);
        assert!(tx.try_send(Packet::new(1i32)).is_ok());
        assert!(tx.try_send(Packet::new(2i32)).is_ok());
        assert!(
            tx.try_send(Packet::new(3i32)).is_err(),
            "third send must not fit in a capacity-2 channel"
        );
    }
}
