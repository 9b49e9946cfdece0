//! `log` backend that ships every enabled log event as a log record.
//!
//! Events are sent through the same [`Transport`] layer as metric records.
//! Delivery problems are never raised to the code that logged: they are
//! reported to a fallback logger (stderr when none is set). Events emitted by
//! this crate itself, and events logged while a dispatch is already running on
//! the same thread, are routed to the fallback as well, so transport
//! diagnostics cannot feed back into the transport.

use crate::{
    builder::{Capture, LogFields, RecordBuilder},
    config::MemoryFloor,
    error::TelemetryError,
    events::Record,
    transport::{Transport, dispatch},
};
use log::{Level, LevelFilter, Log, Metadata};
use std::{
    cell::Cell,
    sync::{Arc, LazyLock},
    thread,
    time::Instant,
};

const OWN_TARGET: &str = env!("CARGO_CRATE_NAME");

thread_local! {
    static DISPATCHING: Cell<bool> = const { Cell::new(false) };
}

struct Reentry;

impl Reentry {
    fn enter() -> Option<Self> {
        DISPATCHING.with(|flag| {
            if flag.get() {
                None
            } else {
                flag.set(true);
                Some(Self)
            }
        })
    }
}

impl Drop for Reentry {
    fn drop(&mut self) {
        DISPATCHING.with(|flag| flag.set(false));
    }
}

fn is_own(target: &str) -> bool {
    target.split("::").next() == Some(OWN_TARGET)
}

static STARTED: LazyLock<Instant> = LazyLock::new(Instant::now);

/// Default fallback: warnings and errors as plain lines on stderr.
///
/// This is the only output of the crate that does not go through `log` or a
/// transport. Install any other `log::Log` with `fallback` to replace it.
struct Stderr;

impl Log for Stderr {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= Level::Warn
    }

    fn log(&self, record: &log::Record<'_>) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}: {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

// Record building and diagnostics shared by both loggers.
struct Shipping {
    builder: RecordBuilder,
    level: LevelFilter,
    fallback: Box<dyn Log>,
    process_name: String,
}

impl Shipping {
    fn new(server_name: &str) -> Self {
        LazyLock::force(&STARTED);
        let process_name = std::env::current_exe()
            .ok()
            .and_then(|path| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "unknown".into());
        Self {
            builder: RecordBuilder::new(server_name, MemoryFloor::default()),
            level: LevelFilter::Info,
            fallback: Box::new(Stderr),
            process_name,
        }
    }

    fn rename(&mut self, server_name: &str) {
        self.builder = RecordBuilder::new(server_name, self.builder.memory_floor());
    }

    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn build(&self, record: &log::Record<'_>) -> Record {
        let current = thread::current();
        let fields = LogFields {
            message: record.args().to_string(),
            raw: record.args().as_str(),
            level: record.level(),
            target: record.target(),
            module: record.module_path(),
            file: record.file(),
            line: record.line(),
            exception: key_value(record, &["exception", "error"]),
            stack: key_value(record, &["stack"]),
            since_start: STARTED.elapsed(),
            process: std::process::id(),
            process_name: &self.process_name,
            thread: format!("{:?}", current.id()),
            thread_name: current.name().unwrap_or("unnamed"),
        };
        Record::Log(self.builder.log(&Capture::now(), &fields))
    }

    fn divert(&self, record: &log::Record<'_>) {
        self.fallback.log(record);
    }

    fn report(&self, logger: &str, error: &TelemetryError) {
        self.fallback.log(
            &log::Record::builder()
                .level(Level::Error)
                .target(OWN_TARGET)
                .args(format_args!("{logger} failed to send log: {error}"))
                .build(),
        );
    }

    fn flush(&self) {
        self.fallback.flush();
    }
}

/// First of `keys` attached to the event, e.g. `log::error!(exception = e; "...")`.
fn key_value(record: &log::Record<'_>, keys: &[&str]) -> Option<String> {
    let source = record.key_values();
    keys.iter()
        .find_map(|key| source.get(log::kv::Key::from_str(key)))
        .map(|value| value.to_string())
}

/// Blocking log backend: each event is sent on the logging thread.
///
/// # Example
/// ```no_run
/// use apm_relay::{DatagramSettings, TelemetryLogger, UnreliableDatagramTransport};
/// use log::LevelFilter;
/// use std::sync::Arc;
///
/// let settings = DatagramSettings::default().server_name("billing");
/// let transport = UnreliableDatagramTransport::new(&settings)?;
/// TelemetryLogger::new(Arc::new(transport))
///     .level(LevelFilter::Debug)
///     .init()?;
/// log::info!("invoice {} settled", 42);
/// # Ok::<(), apm_relay::TelemetryError>(())
/// ```
pub struct TelemetryLogger {
    transport: Arc<dyn Transport>,
    shipping: Shipping,
}

impl TelemetryLogger {
    /// Records are labelled with the transport's configured server name.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let shipping = Shipping::new(transport.server_name());
        Self {
            transport,
            shipping,
        }
    }

    /// Overrides the server name taken from the transport settings.
    #[must_use]
    pub fn server_name(mut self, server_name: &str) -> Self {
        self.shipping.rename(server_name);
        self
    }

    /// Most verbose level shipped. Defaults to `Info`.
    #[must_use]
    pub fn level(mut self, level: LevelFilter) -> Self {
        self.shipping.level = level;
        self
    }

    /// Logger receiving this crate's own diagnostics and delivery failures.
    ///
    /// Defaults to warnings and errors written to stderr.
    #[must_use]
    pub fn fallback(mut self, fallback: Box<dyn Log>) -> Self {
        self.shipping.fallback = fallback;
        self
    }

    /// Installs the logger as the global `log` backend.
    ///
    /// # Errors
    /// Returns an error if a global logger is already set.
    pub fn init(self) -> Result<(), TelemetryError> {
        let level = self.shipping.level;
        log::set_boxed_logger(Box::new(self))?;
        log::set_max_level(level);
        Ok(())
    }
}

impl Log for TelemetryLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        self.shipping.enabled(metadata)
    }

    fn log(&self, record: &log::Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if is_own(record.target()) {
            self.shipping.divert(record);
            return;
        }
        let Some(_reentry) = Reentry::enter() else {
            self.shipping.divert(record);
            return;
        };
        if let Err(e) = dispatch(self.transport.as_ref(), &self.shipping.build(record)) {
            self.shipping.report("TelemetryLogger", &e);
        }
    }

    fn flush(&self) {
        self.shipping.flush();
    }
}

#[cfg(feature = "tokio")]
pub use self::nonblocking::AsyncTelemetryLogger;

#[cfg(feature = "tokio")]
mod nonblocking {
    use super::{Shipping, is_own};
    use crate::{
        error::TelemetryError,
        transport::{AsyncTransport, send_counted},
    };
    use log::{LevelFilter, Log, Metadata};
    use std::sync::Arc;
    use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

    /// Log backend for async applications.
    ///
    /// `log` calls are synchronous, so events are framed on the logging
    /// thread and queued; a task on the Tokio runtime drains the queue in
    /// order and awaits the transport for each one. The transport connects
    /// lazily on the first event.
    pub struct AsyncTelemetryLogger {
        transport: Arc<dyn AsyncTransport>,
        shipping: Shipping,
        queue: UnboundedSender<Vec<u8>>,
    }

    impl AsyncTelemetryLogger {
        /// Creates the logger and spawns its delivery task on the current runtime.
        ///
        /// # Errors
        /// Returns [`TelemetryError::Initialization`] when called outside a Tokio runtime.
        pub fn new(transport: Arc<dyn AsyncTransport>) -> Result<Self, TelemetryError> {
            let runtime = tokio::runtime::Handle::try_current()
                .map_err(|e| TelemetryError::Initialization(e.to_string()))?;
            let (queue, pending) = unbounded_channel();
            runtime.spawn(deliver(Arc::clone(&transport), pending));
            let shipping = Shipping::new(transport.server_name());
            Ok(Self {
                transport,
                shipping,
                queue,
            })
        }

        #[must_use]
        pub fn server_name(mut self, server_name: &str) -> Self {
            self.shipping.rename(server_name);
            self
        }

        #[must_use]
        pub fn level(mut self, level: LevelFilter) -> Self {
            self.shipping.level = level;
            self
        }

        #[must_use]
        pub fn fallback(mut self, fallback: Box<dyn Log>) -> Self {
            self.shipping.fallback = fallback;
            self
        }

        /// Installs the logger as the global `log` backend.
        ///
        /// # Errors
        /// Returns an error if a global logger is already set.
        pub fn init(self) -> Result<(), TelemetryError> {
            let level = self.shipping.level;
            log::set_boxed_logger(Box::new(self))?;
            log::set_max_level(level);
            Ok(())
        }
    }

    async fn deliver(transport: Arc<dyn AsyncTransport>, mut pending: UnboundedReceiver<Vec<u8>>) {
        while let Some(payload) = pending.recv().await {
            if let Err(e) = send_counted(transport.as_ref(), &payload).await {
                log::error!("AsyncTelemetryLogger failed to send log: {e}");
            }
        }
    }

    impl Log for AsyncTelemetryLogger {
        fn enabled(&self, metadata: &Metadata<'_>) -> bool {
            self.shipping.enabled(metadata)
        }

        fn log(&self, record: &log::Record<'_>) {
            if !self.enabled(record.metadata()) {
                return;
            }
            if is_own(record.target()) {
                self.shipping.divert(record);
                return;
            }
            let queued = self
                .transport
                .frame(&self.shipping.build(record))
                .and_then(|payload| {
                    self.queue
                        .send(payload)
                        .map_err(|_| TelemetryError::Closed)
                });
            if let Err(e) = queued {
                self.shipping.report("AsyncTelemetryLogger", &e);
            }
        }

        fn flush(&self) {
            self.shipping.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Capturing {
        payloads: Mutex<Vec<Vec<u8>>>,
    }

    impl Transport for Capturing {
        fn name(&self) -> &'static str {
            "capturing"
        }

        fn connect(&self) -> Result<(), TelemetryError> {
            Ok(())
        }

        fn send(&self, payload: &[u8]) -> Result<(), TelemetryError> {
            self.payloads.lock().unwrap().push(payload.to_vec());
            Ok(())
        }

        fn close(&self) -> Result<(), TelemetryError> {
            Ok(())
        }
    }

    #[test]
    fn own_targets_are_recognised() {
        assert!(is_own("apm_relay"));
        assert!(is_own("apm_relay::transport::broker"));
        assert!(!is_own("apm_relay_ext"));
        assert!(!is_own("billing"));
    }

    #[test]
    fn nested_dispatch_is_refused() {
        let outer = Reentry::enter();
        assert!(outer.is_some());
        assert!(Reentry::enter().is_none());
        drop(outer);
        assert!(Reentry::enter().is_some());
    }

    #[test]
    fn default_fallback_keeps_warnings_and_errors() {
        let metadata = |level| Metadata::builder().level(level).target("apm_relay").build();
        assert!(Stderr.enabled(&metadata(Level::Error)));
        assert!(Stderr.enabled(&metadata(Level::Warn)));
        assert!(!Stderr.enabled(&metadata(Level::Info)));
        assert!(!Stderr.enabled(&metadata(Level::Trace)));
    }

    #[test]
    fn exception_key_becomes_exc_text() {
        let transport = Arc::new(Capturing::default());
        let logger = TelemetryLogger::new(transport.clone()).server_name("billing");
        let kvs: &[(&str, &str)] = &[("exception", "ValueError: x"), ("stack", "main\n  run")];
        logger.log(
            &log::Record::builder()
                .level(Level::Error)
                .target("billing::jobs")
                .args(format_args!("job failed"))
                .key_values(&kvs)
                .build(),
        );
        let payloads = transport.payloads.lock().unwrap();
        assert_eq!(payloads.len(), 1);
        let Record::Log(record) = Record::from_body(crate::RecordKind::Logs, &payloads[0]).unwrap()
        else {
            panic!("expected a log record");
        };
        assert_eq!(record.exc_text, "ValueError: x");
        assert_eq!(record.stack_info.as_deref(), Some("main\n  run"));
        assert!((0.0..1_000.0).contains(&record.msecs));
        assert!(record.relative_created >= 0.0);
        assert_eq!(record.levelname, "ERROR");
        assert_eq!(record.name, "billing::jobs");
        assert_eq!(record.server_name, "billing");
    }
}
