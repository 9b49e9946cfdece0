//! Transparent call wrappers that measure resource usage and ship a metric record.
//!
//! Call sites are registered explicitly with [`CallSite`] (usually through
//! [`call_site!`](crate::call_site)) instead of being discovered by
//! reflection. The wrapped call's return value, error or panic always comes
//! back to the caller unchanged; the record is a side channel, and failures
//! to deliver it are only logged.

use crate::{
    builder::{Capture, Measurement, RecordBuilder},
    config::MemoryFloor,
    events::Record,
    probe::{ProcessProbe, Snapshot},
    transport::{Transport, dispatch},
};
use std::{borrow::Cow, sync::Arc, time::Instant};

/// Identity of an instrumented function: declaring file and function name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallSite {
    path: Cow<'static, str>,
    name: Cow<'static, str>,
}

impl CallSite {
    #[must_use]
    pub const fn new(path: &'static str, name: &'static str) -> Self {
        Self {
            path: Cow::Borrowed(path),
            name: Cow::Borrowed(name),
        }
    }

    /// Builds a call site from runtime strings, e.g. for dynamically registered handlers.
    #[must_use]
    pub fn owned(path: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            path: Cow::Owned(path.into()),
            name: Cow::Owned(name.into()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Creates a [`CallSite`] for `name` declared in the current source file.
///
/// ```
/// let site = apm_relay::call_site!("load_invoice");
/// assert_eq!(site.name(), "load_invoice");
/// assert!(site.path().ends_with(".rs"));
/// ```
#[macro_export]
macro_rules! call_site {
    ($name:expr) => {
        $crate::CallSite::new(file!(), $name)
    };
}

// Shared by the blocking and async instrumentors.
#[derive(Clone)]
struct Meter {
    probe: Arc<dyn ProcessProbe>,
    builder: Arc<RecordBuilder>,
}

impl Meter {
    fn new(probe: Arc<dyn ProcessProbe>, server_name: &str, floor: MemoryFloor) -> Self {
        Self {
            probe,
            builder: Arc::new(RecordBuilder::new(server_name, floor)),
        }
    }

    fn rebuilt(&self, server_name: &str, floor: MemoryFloor) -> Self {
        Self::new(Arc::clone(&self.probe), server_name, floor)
    }

    fn with_server_name(&self, server_name: &str) -> Self {
        self.rebuilt(server_name, self.builder.memory_floor())
    }

    fn with_memory_floor(&self, floor: MemoryFloor) -> Self {
        self.rebuilt(self.builder.server_name(), floor)
    }

    fn start(&self) -> (Snapshot, Instant) {
        (self.probe.snapshot(), Instant::now())
    }

    fn finish(&self, site: &CallSite, start: Snapshot, started: Instant) -> Record {
        let elapsed = started.elapsed();
        let end = self.probe.snapshot();
        let measurement = Measurement {
            elapsed,
            start,
            end,
        };
        Record::Metric(self.builder.metric(&Capture::now(), site, &measurement))
    }
}

/// Wraps blocking calls with a measurement envelope.
///
/// # Example
/// ```no_run
/// use apm_relay::{
///     DatagramSettings, Instrumentor, ProcessCpuTime, UnreliableDatagramTransport, call_site,
/// };
/// use std::sync::Arc;
///
/// let settings = DatagramSettings::default().server_name("billing");
/// let transport = UnreliableDatagramTransport::new(&settings)?;
/// let apm = Instrumentor::new(Arc::new(transport), Arc::new(ProcessCpuTime::new()?));
///
/// let total = apm.call(&call_site!("sum_invoices"), || (1..=10).sum::<u32>());
/// assert_eq!(total, 55);
/// # Ok::<(), apm_relay::TelemetryError>(())
/// ```
#[derive(Clone)]
pub struct Instrumentor {
    transport: Arc<dyn Transport>,
    meter: Meter,
}

impl Instrumentor {
    /// Records are labelled with the transport's configured server name.
    pub fn new(transport: Arc<dyn Transport>, probe: Arc<dyn ProcessProbe>) -> Self {
        let meter = Meter::new(probe, transport.server_name(), MemoryFloor::default());
        Self { transport, meter }
    }

    /// Overrides the server name taken from the transport settings.
    #[must_use]
    pub fn server_name(mut self, server_name: &str) -> Self {
        self.meter = self.meter.with_server_name(server_name);
        self
    }

    #[must_use]
    pub fn memory_floor(mut self, floor: MemoryFloor) -> Self {
        self.meter = self.meter.with_memory_floor(floor);
        self
    }

    /// Runs `f` and ships one metric record for it, whatever its outcome.
    ///
    /// The end measurement and dispatch happen before this returns, or while
    /// unwinding if `f` panics.
    pub fn call<R>(&self, site: &CallSite, f: impl FnOnce() -> R) -> R {
        let _guard = CallGuard::start(self, site);
        f()
    }

    /// Returns a function with the same input and output as `f` that records each call.
    ///
    /// Functions of several arguments take them as a tuple.
    pub fn wrap<A, R, F>(
        &self,
        site: CallSite,
        f: F,
    ) -> impl Fn(A) -> R + Send + Sync + use<A, R, F>
    where
        F: Fn(A) -> R + Send + Sync,
    {
        let this = self.clone();
        move |args| this.call(&site, || f(args))
    }

    fn emit(&self, record: &Record) {
        if let Err(e) = dispatch(self.transport.as_ref(), record) {
            log::warn!(
                "failed to send APM data over {}: {e}",
                self.transport.name()
            );
        }
    }
}

struct CallGuard<'a> {
    instrumentor: &'a Instrumentor,
    site: &'a CallSite,
    start: Snapshot,
    started: Instant,
}

impl<'a> CallGuard<'a> {
    fn start(instrumentor: &'a Instrumentor, site: &'a CallSite) -> Self {
        let (start, started) = instrumentor.meter.start();
        Self {
            instrumentor,
            site,
            start,
            started,
        }
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        let record = self
            .instrumentor
            .meter
            .finish(self.site, self.start, self.started);
        self.instrumentor.emit(&record);
    }
}

#[cfg(feature = "tokio")]
pub use self::nonblocking::AsyncInstrumentor;

#[cfg(feature = "tokio")]
mod nonblocking {
    use super::{CallSite, Meter};
    use crate::{
        config::MemoryFloor,
        events::Record,
        probe::{ProcessProbe, Snapshot},
        transport::{AsyncTransport, dispatch_async},
    };
    use std::{future::Future, pin::Pin, sync::Arc, time::Instant};

    /// Wraps futures with a measurement envelope.
    ///
    /// Elapsed time is wall-clock time from first poll to completion, so it
    /// includes time the task spent suspended. The record is sent, and the
    /// send awaited, before the wrapped output is returned. A future dropped
    /// before completion is measured up to the drop and its record is sent
    /// from a spawned task.
    #[derive(Clone)]
    pub struct AsyncInstrumentor {
        transport: Arc<dyn AsyncTransport>,
        meter: Meter,
    }

    impl AsyncInstrumentor {
        pub fn new(transport: Arc<dyn AsyncTransport>, probe: Arc<dyn ProcessProbe>) -> Self {
            let meter = Meter::new(probe, transport.server_name(), MemoryFloor::default());
            Self { transport, meter }
        }

        #[must_use]
        pub fn server_name(mut self, server_name: &str) -> Self {
            self.meter = self.meter.with_server_name(server_name);
            self
        }

        #[must_use]
        pub fn memory_floor(mut self, floor: MemoryFloor) -> Self {
            self.meter = self.meter.with_memory_floor(floor);
            self
        }

        /// Awaits `fut`, then ships one metric record for it.
        pub async fn call<F: Future>(&self, site: &CallSite, fut: F) -> F::Output {
            let mut guard = AsyncCallGuard::start(self, site);
            let output = fut.await;
            let record = guard.complete();
            emit(self.transport.as_ref(), &record).await;
            output
        }

        /// Async counterpart of [`super::Instrumentor::wrap`].
        pub fn wrap<A, F, Fut>(
            &self,
            site: CallSite,
            f: F,
        ) -> impl Fn(A) -> Pin<Box<dyn Future<Output = Fut::Output> + Send>>
        + Send
        + Sync
        + use<A, F, Fut>
        where
            A: 'static,
            F: Fn(A) -> Fut + Send + Sync + 'static,
            Fut: Future + Send + 'static,
            Fut::Output: Send + 'static,
        {
            let this = self.clone();
            let site = Arc::new(site);
            move |args| {
                let this = this.clone();
                let site = Arc::clone(&site);
                let fut = f(args);
                Box::pin(async move { this.call(&site, fut).await })
            }
        }
    }

    async fn emit(transport: &dyn AsyncTransport, record: &Record) {
        if let Err(e) = dispatch_async(transport, record).await {
            log::warn!("failed to send APM data over {}: {e}", transport.name());
        }
    }

    struct AsyncCallGuard<'a> {
        instrumentor: &'a AsyncInstrumentor,
        site: &'a CallSite,
        start: Snapshot,
        started: Instant,
        completed: bool,
    }

    impl<'a> AsyncCallGuard<'a> {
        fn start(instrumentor: &'a AsyncInstrumentor, site: &'a CallSite) -> Self {
            let (start, started) = instrumentor.meter.start();
            Self {
                instrumentor,
                site,
                start,
                started,
                completed: false,
            }
        }

        fn complete(&mut self) -> Record {
            self.completed = true;
            self.instrumentor
                .meter
                .finish(self.site, self.start, self.started)
        }
    }

    impl Drop for AsyncCallGuard<'_> {
        fn drop(&mut self) {
            if self.completed {
                return;
            }
            let record = self.complete();
            let transport = Arc::clone(&self.instrumentor.transport);
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move { emit(transport.as_ref(), &record).await });
                }
                Err(_) => log::warn!(
                    "APM record for cancelled call {} dropped: no runtime to send it",
                    self.site.name()
                ),
            }
        }
    }
}
