#![allow(dead_code)]

use apm_relay::{
    BrokerChannel, BrokerConnector, BrokerSettings, ProcessProbe, Snapshot, TelemetryError,
    Transport,
};
use std::sync::{
    Arc, Barrier, Mutex,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

/// One message accepted by the in-memory broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub queue: String,
    pub body: Vec<u8>,
    pub persistent: bool,
}

/// Broker state shared by every connection opened through [`MemoryBroker`].
#[derive(Debug, Default)]
pub struct BrokerState {
    pub published: Mutex<Vec<Published>>,
    pub declared: Mutex<Vec<(String, bool)>>,
    pub connects: AtomicUsize,
    pub refuse_connections: AtomicBool,
    pub fail_next_publish: AtomicBool,
    /// Liveness flag of every channel ever handed out.
    pub channels: Mutex<Vec<Arc<AtomicBool>>>,
    /// When set, each publish waits on the barrier twice: once on arrival
    /// and once before it completes.
    pub gate: Mutex<Option<Arc<Barrier>>>,
}

impl BrokerState {
    pub fn published(&self) -> Vec<Published> {
        self.published.lock().unwrap().clone()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn open_channels(&self) -> usize {
        self.channels
            .lock()
            .unwrap()
            .iter()
            .filter(|alive| alive.load(Ordering::SeqCst))
            .count()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    pub state: Arc<BrokerState>,
}

impl MemoryBroker {
    pub fn refusing() -> Self {
        let broker = Self::default();
        broker.state.refuse_connections.store(true, Ordering::SeqCst);
        broker
    }
}

#[derive(Debug)]
pub struct MemoryChannel {
    state: Arc<BrokerState>,
    pub alive: Arc<AtomicBool>,
}

impl BrokerConnector for MemoryBroker {
    type Channel = MemoryChannel;

    fn connect(&self, _settings: &BrokerSettings) -> Result<MemoryChannel, TelemetryError> {
        if self.state.refuse_connections.load(Ordering::SeqCst) {
            return Err(TelemetryError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            )));
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        let alive = Arc::new(AtomicBool::new(true));
        self.state.channels.lock().unwrap().push(Arc::clone(&alive));
        Ok(MemoryChannel {
            state: Arc::clone(&self.state),
            alive,
        })
    }
}

impl MemoryChannel {
    fn publish_message(
        &self,
        queue: &str,
        body: &[u8],
        persistent: bool,
    ) -> Result<(), TelemetryError> {
        let gate = self.state.gate.lock().unwrap().clone();
        if let Some(gate) = &gate {
            gate.wait();
        }
        if self.state.fail_next_publish.swap(false, Ordering::SeqCst) {
            self.alive.store(false, Ordering::SeqCst);
            return Err(TelemetryError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "connection reset by broker",
            )));
        }
        self.state.published.lock().unwrap().push(Published {
            queue: queue.to_string(),
            body: body.to_vec(),
            persistent,
        });
        if let Some(gate) = &gate {
            gate.wait();
        }
        Ok(())
    }
}

impl BrokerChannel for MemoryChannel {
    fn declare_queue(&mut self, queue: &str, durable: bool) -> Result<(), TelemetryError> {
        self.state
            .declared
            .lock()
            .unwrap()
            .push((queue.to_string(), durable));
        Ok(())
    }

    fn publish(
        &mut self,
        queue: &str,
        body: &[u8],
        persistent: bool,
    ) -> Result<(), TelemetryError> {
        self.publish_message(queue, body, persistent)
    }

    fn is_open(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn close(&mut self) -> Result<(), TelemetryError> {
        self.alive.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(feature = "tokio")]
mod nonblocking {
    use super::{MemoryBroker, MemoryChannel, RecordingTransport};
    use apm_relay::{
        AsyncBrokerChannel, AsyncBrokerConnector, AsyncTransport, BrokerChannel, BrokerConnector,
        BrokerSettings, Record, TelemetryError, Transport,
    };
    use async_trait::async_trait;

    #[async_trait]
    impl AsyncBrokerConnector for MemoryBroker {
        type Channel = MemoryChannel;

        async fn connect(
            &self,
            settings: &BrokerSettings,
        ) -> Result<MemoryChannel, TelemetryError> {
            BrokerConnector::connect(self, settings)
        }
    }

    #[async_trait]
    impl AsyncBrokerChannel for MemoryChannel {
        async fn declare_queue(
            &mut self,
            queue: &str,
            durable: bool,
        ) -> Result<(), TelemetryError> {
            BrokerChannel::declare_queue(self, queue, durable)
        }

        async fn publish(
            &mut self,
            queue: &str,
            body: &[u8],
            persistent: bool,
        ) -> Result<(), TelemetryError> {
            self.publish_message(queue, body, persistent)
        }

        fn is_open(&self) -> bool {
            BrokerChannel::is_open(self)
        }

        async fn close(&mut self) -> Result<(), TelemetryError> {
            BrokerChannel::close(self)
        }
    }

    #[async_trait]
    impl AsyncTransport for RecordingTransport {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn connect(&self) -> Result<(), TelemetryError> {
            Ok(())
        }

        fn frame(&self, record: &Record) -> Result<Vec<u8>, TelemetryError> {
            record.to_envelope()
        }

        async fn send(&self, payload: &[u8]) -> Result<(), TelemetryError> {
            Transport::send(self, payload)
        }

        async fn close(&self) -> Result<(), TelemetryError> {
            Ok(())
        }
    }
}

/// Transport that keeps every payload in memory.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    pub payloads: Mutex<Vec<Vec<u8>>>,
    pub failing: AtomicBool,
}

impl RecordingTransport {
    pub fn failing() -> Self {
        let transport = Self::default();
        transport.failing.store(true, Ordering::SeqCst);
        transport
    }

    pub fn records(&self) -> Vec<apm_relay::Record> {
        self.payloads
            .lock()
            .unwrap()
            .iter()
            .map(|payload| apm_relay::Record::from_envelope(payload).unwrap())
            .collect()
    }
}

impl Transport for RecordingTransport {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn connect(&self) -> Result<(), TelemetryError> {
        Ok(())
    }

    fn frame(&self, record: &apm_relay::Record) -> Result<Vec<u8>, TelemetryError> {
        record.to_envelope()
    }

    fn send(&self, payload: &[u8]) -> Result<(), TelemetryError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TelemetryError::Dispatch("collector unreachable".into()));
        }
        self.payloads.lock().unwrap().push(payload.to_vec());
        Ok(())
    }

    fn close(&self) -> Result<(), TelemetryError> {
        Ok(())
    }
}

/// Probe returning scripted snapshots in order, repeating the last one.
#[derive(Debug)]
pub struct ScriptedProbe {
    readings: Mutex<Vec<Snapshot>>,
}

impl ScriptedProbe {
    pub fn new(mut readings: Vec<Snapshot>) -> Self {
        readings.reverse();
        Self {
            readings: Mutex::new(readings),
        }
    }

    pub fn fixed() -> Self {
        Self::new(vec![Snapshot {
            cpu_seconds: 1.0,
            resident_bytes: 4096,
        }])
    }
}

impl ProcessProbe for ScriptedProbe {
    fn snapshot(&self) -> Snapshot {
        let mut readings = self.readings.lock().unwrap();
        if readings.len() > 1 {
            readings.pop().unwrap()
        } else {
            readings.last().copied().unwrap_or_default()
        }
    }
}
