//! End-to-end scenario tests covering a full network run through
//! [`Network::run`]: pipeline composition, backpressure, deadlock,
//! mid-stream component errors, fan-out, and IIP-only input.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fbp_core::prelude::*;

fn rt() -> compio::runtime::Runtime {
    compio::runtime::Runtime::new().unwrap()
}

// ---- "Hello Goodbye World" pipeline ----

struct LineToWords;

#[async_trait]
impl ComponentBody for LineToWords {
    async fn run(&self, ctx: &mut ComponentContext) -> Result<()> {
        let line = ctx.input("IN")?.receive_once().await?;
        let line = line
            .into_contents::<String>()
            .map_err(|_| FbpError::component_error(ctx.name(), "expected a String line"))?;
        for word in line.split_whitespace() {
            let packet = ctx.create(word.to_string());
            ctx.send("OUT", packet).await?;
        }
        Ok(())
    }
}

struct StartsWith;

#[async_trait]
impl ComponentBody for StartsWith {
    async fn run(&self, ctx: &mut ComponentContext) -> Result<()> {
        let test = ctx
            .input("TEST")?
            .receive_once()
            .await?
            .into_contents::<String>()
            .map_err(|_| FbpError::component_error(ctx.name(), "expected a String prefix"))?;

        while let Some(packet) = ctx.recv("IN").await? {
            let starts = packet.get_contents::<String>().is_some_and(|w| w.starts_with(&test));
            if !starts {
                ctx.send("REJ", packet).await?;
            }
        }
        Ok(())
    }
}

struct WordsToLine;

#[async_trait]
impl ComponentBody for WordsToLine {
    async fn run(&self, ctx: &mut ComponentContext) -> Result<()> {
        let measure_raw = ctx
            .input("MEASURE")?
            .receive_once()
            .await?
            .into_contents::<i64>()
            .map_err(|_| FbpError::component_error(ctx.name(), "expected an i64 width"))?;
        let measure = measure_raw.max(0) as usize;

        let mut buf = String::new();
        while let Some(packet) = ctx.recv("IN").await? {
            let word = packet.into_contents::<String>().map_err(|_| FbpError::component_error(ctx.name(), "expected a String word"))?;
            if measure == 0 {
                let out = ctx.create(word);
                ctx.send("OUT", out).await?;
                continue;
            }
            if !buf.is_empty() && buf.len() + 1 + word.len() > measure {
                let out = ctx.create(std::mem::take(&mut buf));
                ctx.send("OUT", out).await?;
            }
            if !buf.is_empty() {
                buf.push(' ');
            }
            buf.push_str(&word);
        }
        if !buf.is_empty() {
            let out = ctx.create(buf);
            ctx.send("OUT", out).await?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct Output {
    lines: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl ComponentBody for Output {
    async fn run(&self, ctx: &mut ComponentContext) -> Result<()> {
        while let Some(packet) = ctx.recv("IN").await? {
            let line = packet.into_contents::<String>().map_err(|_| FbpError::component_error(ctx.name(), "expected a String line"))?;
            self.lines.lock().unwrap().push(line);
        }
        Ok(())
    }
}

#[test]
fn hello_goodbye_world_pipeline() {
    rt().block_on(async {
        let mut network = Network::new(NetworkConfig::default());

        network
            .add_component(
                "LineToWords",
                ComponentDescriptor::new("LineToWords")
                    .inport(PortSpec::new("IN", PortType::of::<String>()))
                    .outport(PortSpec::new("OUT", PortType::of::<String>())),
                Arc::new(LineToWords),
            )
            .unwrap();
        network
            .add_component(
                "StartsWith",
                ComponentDescriptor::new("StartsWith")
                    .inport(PortSpec::new("IN", PortType::of::<String>()))
                    .inport(PortSpec::new("TEST", PortType::of::<String>()))
                    .outport(PortSpec::new("REJ", PortType::of::<String>())),
                Arc::new(StartsWith),
            )
            .unwrap();
        network
            .add_component(
                "WordsToLine",
                ComponentDescriptor::new("WordsToLine")
                    .inport(PortSpec::new("IN", PortType::of::<String>()))
                    .inport(PortSpec::new("MEASURE", PortType::of::<i64>()))
                    .outport(PortSpec::new("OUT", PortType::of::<String>())),
                Arc::new(WordsToLine),
            )
            .unwrap();
        let output = Arc::new(Output::default());
        network
            .add_component(
                "Output",
                ComponentDescriptor::new("Output").inport(PortSpec::new("IN", PortType::of::<String>())),
                Arc::clone(&output) as Arc<dyn ComponentBody>,
            )
            .unwrap();

        network.connect(PortRef::new("LineToWords", "OUT"), PortRef::new("StartsWith", "IN"), None).unwrap();
        network.connect(PortRef::new("StartsWith", "REJ"), PortRef::new("WordsToLine", "IN"), None).unwrap();
        network.connect(PortRef::new("WordsToLine", "OUT"), PortRef::new("Output", "IN"), None).unwrap();

        network.initialize(PortRef::new("LineToWords", "IN"), "Hello Goodbye World".to_string()).unwrap();
        network.initialize(PortRef::new("StartsWith", "TEST"), "G".to_string()).unwrap();
        network.initialize(PortRef::new("WordsToLine", "MEASURE"), 0i64).unwrap();

        let outcome = network.run().await.unwrap();
        assert!(matches!(outcome, RunOutcome::Quiesced));
        assert_eq!(*output.lines.lock().unwrap(), vec!["Hello".to_string(), "World".to_string()]);
    });
}

// ---- backpressure ----

struct FastProducer {
    count: usize,
}

#[async_trait]
impl ComponentBody for FastProducer {
    async fn run(&self, ctx: &mut ComponentContext) -> Result<()> {
        for i in 0..self.count {
            let out = ctx.create(i as i32);
            ctx.send("OUT", out).await?;
        }
        Ok(())
    }
}

struct SlowConsumer {
    received: Arc<AtomicUsize>,
}

#[async_trait]
impl ComponentBody for SlowConsumer {
    async fn run(&self, ctx: &mut ComponentContext) -> Result<()> {
        while let Some(_packet) = ctx.recv("IN").await? {
            compio::time::sleep(Duration::from_micros(1)).await;
            self.received.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

#[test]
fn backpressure_delivers_every_packet_through_a_bounded_queue() {
    rt().block_on(async {
        let mut network = Network::new(NetworkConfig::default());
        network
            .add_component(
                "Fast",
                ComponentDescriptor::new("Fast").outport(PortSpec::new("OUT", PortType::of::<i32>())),
                Arc::new(FastProducer { count: 1000 }),
            )
            .unwrap();
        let received = Arc::new(AtomicUsize::new(0));
        network
            .add_component(
                "Slow",
                ComponentDescriptor::new("Slow").inport(PortSpec::new("IN", PortType::of::<i32>())),
                Arc::new(SlowConsumer { received: Arc::clone(&received) }),
            )
            .unwrap();
        network.connect(PortRef::new("Fast", "OUT"), PortRef::new("Slow", "IN"), Some(4)).unwrap();

        let outcome = network.run().await.unwrap();
        assert!(matches!(outcome, RunOutcome::Quiesced));
        assert_eq!(received.load(Ordering::Relaxed), 1000);
    });
}

// ---- deadlock ----

struct SendTwiceNeverRead;

#[async_trait]
impl ComponentBody for SendTwiceNeverRead {
    async fn run(&self, ctx: &mut ComponentContext) -> Result<()> {
        let p1 = ctx.create(1i32);
        ctx.send("OUT", p1).await?;
        let p2 = ctx.create(2i32);
        ctx.send("OUT", p2).await?;
        Ok(())
    }
}

#[test]
fn mutual_full_queue_block_is_reported_as_deadlock() {
    rt().block_on(async {
        let config = NetworkConfig::default().with_deadlock_strict(true).with_deadlock_poll_interval(Duration::from_millis(1));
        let mut network = Network::new(config);

        for name in ["A", "B"] {
            network
                .add_component(
                    name,
                    ComponentDescriptor::new(name)
                        .inport(PortSpec::new("IN", PortType::of::<i32>()))
                        .outport(PortSpec::new("OUT", PortType::of::<i32>())),
                    Arc::new(SendTwiceNeverRead),
                )
                .unwrap();
        }
        network.connect(PortRef::new("A", "OUT"), PortRef::new("B", "IN"), Some(1)).unwrap();
        network.connect(PortRef::new("B", "OUT"), PortRef::new("A", "IN"), Some(1)).unwrap();

        let outcome = network.run().await.unwrap();
        match outcome {
            RunOutcome::Deadlocked(mut suspended) => {
                suspended.sort();
                assert_eq!(suspended, vec!["A".to_string(), "B".to_string()]);
            }
            other => panic!("expected Deadlocked, got {other:?}"),
        }
    });
}

// ---- component error mid-stream ----

struct CountingProducer {
    sent_ok: Arc<AtomicUsize>,
    hit_closed: Arc<AtomicBool>,
}

#[async_trait]
impl ComponentBody for CountingProducer {
    async fn run(&self, ctx: &mut ComponentContext) -> Result<()> {
        for i in 1..=10 {
            let packet = ctx.create(i);
            match ctx.send("OUT", packet).await {
                Ok(()) => {
                    self.sent_ok.fetch_add(1, Ordering::Relaxed);
                }
                Err(FbpError::DownstreamClosed { .. }) => {
                    self.hit_closed.store(true, Ordering::Relaxed);
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

struct ErrorOnFifth;

#[async_trait]
impl ComponentBody for ErrorOnFifth {
    async fn run(&self, ctx: &mut ComponentContext) -> Result<()> {
        let mut n = 0usize;
        while let Some(packet) = ctx.recv("IN").await? {
            n += 1;
            if n == 5 {
                return Err(FbpError::component_error(ctx.name(), "boom on the fifth packet"));
            }
            ctx.send("OUT", packet).await?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct CollectingSink {
    received: Arc<Mutex<Vec<i32>>>,
}

#[async_trait]
impl ComponentBody for CollectingSink {
    async fn run(&self, ctx: &mut ComponentContext) -> Result<()> {
        while let Some(packet) = ctx.recv("IN").await? {
            self.received.lock().unwrap().push(*packet.get_contents::<i32>().unwrap());
        }
        Ok(())
    }
}

#[test]
fn component_error_closes_both_directions_and_is_reported() {
    rt().block_on(async {
        let mut network = Network::new(NetworkConfig::default());

        let sent_ok = Arc::new(AtomicUsize::new(0));
        let hit_closed = Arc::new(AtomicBool::new(false));
        network
            .add_component(
                "Producer",
                ComponentDescriptor::new("Producer").outport(PortSpec::new("OUT", PortType::of::<i32>())),
                Arc::new(CountingProducer { sent_ok: Arc::clone(&sent_ok), hit_closed: Arc::clone(&hit_closed) }),
            )
            .unwrap();
        network
            .add_component(
                "Faulty",
                ComponentDescriptor::new("Faulty")
                    .inport(PortSpec::new("IN", PortType::of::<i32>()))
                    .outport(PortSpec::new("OUT", PortType::of::<i32>())),
                Arc::new(ErrorOnFifth),
            )
            .unwrap();
        let sink = Arc::new(CollectingSink::default());
        network
            .add_component(
                "Sink",
                ComponentDescriptor::new("Sink").inport(PortSpec::new("IN", PortType::of::<i32>())),
                Arc::clone(&sink) as Arc<dyn ComponentBody>,
            )
            .unwrap();

        network.connect(PortRef::new("Producer", "OUT"), PortRef::new("Faulty", "IN"), None).unwrap();
        network.connect(PortRef::new("Faulty", "OUT"), PortRef::new("Sink", "IN"), None).unwrap();

        let outcome = network.run().await.unwrap();
        match outcome {
            RunOutcome::Errored(errors) => {
                assert_eq!(errors.len(), 1);
                assert!(matches!(&errors[0], FbpError::ComponentError { component, .. } if component == "Faulty"));
            }
            other => panic!("expected Errored, got {other:?}"),
        }
        assert_eq!(*sink.received.lock().unwrap(), vec![1, 2, 3, 4]);
        assert!(hit_closed.load(Ordering::Relaxed), "producer must observe DownstreamClosed");
    });
}

// ---- fan-out ----

struct EmitThree;

#[async_trait]
impl ComponentBody for EmitThree {
    async fn run(&self, ctx: &mut ComponentContext) -> Result<()> {
        for v in [1, 2, 3] {
            let out = ctx.create(v);
            ctx.send("OUT", out).await?;
        }
        Ok(())
    }
}

#[test]
fn fan_out_delivers_the_full_sequence_to_every_downstream() {
    rt().block_on(async {
        let mut network = Network::new(NetworkConfig::default());
        network
            .add_component(
                "Src",
                ComponentDescriptor::new("Src").outport(PortSpec::new("OUT", PortType::cloneable::<i32>())),
                Arc::new(EmitThree),
            )
            .unwrap();

        let sinks: Vec<_> = (0..3).map(|_| Arc::new(CollectingSink::default())).collect();
        for (i, sink) in sinks.iter().enumerate() {
            let name = format!("Sink{i}");
            network
                .add_component(
                    name.clone(),
                    ComponentDescriptor::new("Sink").inport(PortSpec::new("IN", PortType::of::<i32>())),
                    Arc::clone(sink) as Arc<dyn ComponentBody>,
                )
                .unwrap();
            network.connect(PortRef::new("Src", "OUT"), PortRef::new(name, "IN"), None).unwrap();
        }

        let outcome = network.run().await.unwrap();
        assert!(matches!(outcome, RunOutcome::Quiesced));

        let mut total = 0;
        for sink in &sinks {
            let received = sink.received.lock().unwrap();
            assert_eq!(*received, vec![1, 2, 3]);
            total += received.len();
        }
        assert_eq!(total, 9);
    });
}

// ---- IIP-only input ----

struct IipOnly {
    first: Arc<Mutex<Option<i32>>>,
    second_was_eos: Arc<AtomicBool>,
}

#[async_trait]
impl ComponentBody for IipOnly {
    async fn run(&self, ctx: &mut ComponentContext) -> Result<()> {
        let first = ctx.input("IN")?.receive_once().await?;
        *self.first.lock().unwrap() = Some(*first.get_contents::<i32>().unwrap());

        let second = ctx.input("IN")?.receive().await;
        self.second_was_eos.store(second.is_none(), Ordering::Relaxed);
        Ok(())
    }
}

#[test]
fn iip_only_input_yields_value_then_end_of_stream() {
    rt().block_on(async {
        let mut network = Network::new(NetworkConfig::default());
        let first = Arc::new(Mutex::new(None));
        let second_was_eos = Arc::new(AtomicBool::new(false));
        network
            .add_component(
                "Comp",
                ComponentDescriptor::new("Comp").inport(PortSpec::new("IN", PortType::of::<i32>())),
                Arc::new(IipOnly { first: Arc::clone(&first), second_was_eos: Arc::clone(&second_was_eos) }),
            )
            .unwrap();
        network.initialize(PortRef::new("Comp", "IN"), 42i32).unwrap();

        let outcome = network.run().await.unwrap();
        assert!(matches!(outcome, RunOutcome::Quiesced));
        assert_eq!(*first.lock().unwrap(), Some(42));
        assert!(second_was_eos.load(Ordering::Relaxed));
    });
}
