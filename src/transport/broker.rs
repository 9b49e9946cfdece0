use super::{BROKER_CONNECTS, BrokerChannel, BrokerConnector, Transport};
use crate::{config::BrokerSettings, error::TelemetryError};
use std::{
    cell::RefCell,
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, ThreadId},
};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(0);

struct Slots<Ch> {
    channels: HashMap<ThreadId, Ch>,
    closed: bool,
}

// Lets a thread's exit hook reach pools of any channel type.
trait Evict: Send + Sync {
    fn evict(&self, worker: ThreadId);
}

impl<Ch: BrokerChannel> Evict for Mutex<Slots<Ch>> {
    fn evict(&self, worker: ThreadId) {
        let removed = self
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .channels
            .remove(&worker);
        if let Some(mut channel) = removed {
            log::debug!("closing broker channel of exited {worker:?}");
            let _ = channel.close();
        }
    }
}

/// Pools the current thread has released a channel into, evicted when the thread exits.
struct WorkerExit {
    worker: ThreadId,
    pools: HashMap<u64, Weak<dyn Evict>>,
}

impl Drop for WorkerExit {
    fn drop(&mut self) {
        for pool in self.pools.values().filter_map(Weak::upgrade) {
            pool.evict(self.worker);
        }
    }
}

thread_local! {
    static WORKER_EXIT: RefCell<WorkerExit> = RefCell::new(WorkerExit {
        worker: thread::current().id(),
        pools: HashMap::new(),
    });
}

/// Registry of broker channels keyed by worker thread.
///
/// A worker checks its channel out with [`ConnectionPool::acquire`], uses it
/// without holding any lock, and hands it back with
/// [`ConnectionPool::release`]. A channel that is not released (because a
/// publish failed) is simply gone: the next `acquire` for that worker opens a
/// fresh connection and re-declares the queue. Channels never move between
/// workers, and a channel released by its own worker is closed when that
/// worker thread exits.
pub struct ConnectionPool<C: BrokerConnector> {
    id: u64,
    connector: C,
    settings: BrokerSettings,
    slots: Arc<Mutex<Slots<C::Channel>>>,
}

impl<C: BrokerConnector> ConnectionPool<C> {
    pub fn new(connector: C, settings: BrokerSettings) -> Self {
        Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            connector,
            settings,
            slots: Arc::new(Mutex::new(Slots {
                channels: HashMap::new(),
                closed: false,
            })),
        }
    }

    /// Checks out `worker`'s channel, opening one if it has none or its channel died.
    ///
    /// # Errors
    /// Returns [`TelemetryError::Closed`] after [`Self::close_all`], or an error
    /// if a new connection or the queue declaration fails.
    pub fn acquire(&self, worker: ThreadId) -> Result<C::Channel, TelemetryError> {
        let checked_out = {
            let mut slots = self.slots();
            if slots.closed {
                return Err(TelemetryError::Closed);
            }
            slots.channels.remove(&worker)
        };
        match checked_out {
            Some(channel) if channel.is_open() => return Ok(channel),
            Some(mut stale) => {
                log::debug!("discarding closed broker channel of {worker:?}");
                let _ = stale.close();
            }
            None => {}
        }
        self.open()
    }

    /// Returns a channel checked out by `worker`.
    ///
    /// The channel is closed instead if the pool was closed while it was out.
    pub fn release(&self, worker: ThreadId, channel: C::Channel) {
        let mut rejected = Some(channel);
        let previous = {
            let mut slots = self.slots();
            if slots.closed {
                None
            } else {
                rejected.take().and_then(|channel| slots.channels.insert(worker, channel))
            }
        };
        for mut channel in rejected.into_iter().chain(previous) {
            let _ = channel.close();
        }
        if worker == thread::current().id() {
            self.evict_on_exit();
        }
    }

    /// Drops and closes `worker`'s idle channel, if any.
    pub fn invalidate(&self, worker: ThreadId) {
        self.slots.evict(worker);
    }

    /// Number of workers holding an idle channel.
    pub fn len(&self) -> usize {
        self.slots().channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots().channels.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.slots().closed
    }

    pub const fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    /// Closes every idle channel and refuses further checkouts.
    ///
    /// Channels checked out at this point are closed when released.
    ///
    /// # Errors
    /// Returns the first close error; every channel is still removed.
    pub fn close_all(&self) -> Result<(), TelemetryError> {
        let channels: Vec<_> = {
            let mut slots = self.slots();
            slots.closed = true;
            slots.channels.drain().map(|(_, channel)| channel).collect()
        };
        let mut first_error = None;
        for mut channel in channels {
            if let Err(e) = channel.close() {
                log::error!("failed to close broker connection: {e}");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn open(&self) -> Result<C::Channel, TelemetryError> {
        let mut channel = self.connector.connect(&self.settings)?;
        channel.declare_queue(&self.settings.queue, true)?;
        metrics::counter!(BROKER_CONNECTS).increment(1);
        Ok(channel)
    }

    fn evict_on_exit(&self) {
        let slots = Arc::downgrade(&self.slots);
        let slots: Weak<dyn Evict> = slots;
        // Fails only while the thread is already tearing down its locals.
        let _ = WORKER_EXIT.try_with(|exit| {
            exit.borrow_mut().pools.entry(self.id).or_insert(slots);
        });
    }

    fn slots(&self) -> MutexGuard<'_, Slots<C::Channel>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Publishes records as persistent messages on a durable broker queue.
///
/// Construction validates the credentials and connects eagerly for the
/// constructing thread. If that first connection fails the transport stays
/// unusable: the failure is logged once and every later send is dropped with a
/// warning. Once initialized, each worker thread lazily gets its own channel
/// from the [`ConnectionPool`], and any publish failure discards that
/// channel so the worker's next send reconnects.
pub struct ReliableQueueTransport<C: BrokerConnector> {
    pool: ConnectionPool<C>,
    initialized: AtomicBool,
}

impl<C: BrokerConnector> ReliableQueueTransport<C> {
    /// Validates `settings` and opens the first connection.
    ///
    /// # Example
    /// ```no_run
    /// # #[cfg(feature = "amqp")] {
    /// use apm_relay::{BrokerSettings, ReliableQueueTransport, transport::amqp::AmqpConnector};
    ///
    /// let settings = BrokerSettings::metrics().credentials("user", "password");
    /// let transport = ReliableQueueTransport::new(AmqpConnector::default(), settings)?;
    /// # }
    /// # Ok::<(), apm_relay::TelemetryError>(())
    /// ```
    ///
    /// # Errors
    /// Returns [`TelemetryError::MissingCredentials`] if the user or password is empty.
    /// An unreachable broker is not an error here; see [`Self::is_initialized`].
    pub fn new(connector: C, settings: BrokerSettings) -> Result<Self, TelemetryError> {
        settings.validate()?;
        let transport = Self {
            pool: ConnectionPool::new(connector, settings),
            initialized: AtomicBool::new(true),
        };
        if let Err(e) = transport.connect() {
            log::error!("ReliableQueueTransport initialization failed: {e}");
            transport.initialized.store(false, Ordering::Release);
        }
        Ok(transport)
    }

    /// Whether the first connection succeeded.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub const fn pool(&self) -> &ConnectionPool<C> {
        &self.pool
    }

    pub fn queue(&self) -> &str {
        &self.pool.settings().queue
    }
}

impl<C: BrokerConnector> Transport for ReliableQueueTransport<C> {
    fn name(&self) -> &'static str {
        "broker"
    }

    fn server_name(&self) -> &str {
        &self.pool.settings().server_name
    }

    fn connect(&self) -> Result<(), TelemetryError> {
        let worker = thread::current().id();
        let channel = self
            .pool
            .acquire(worker)
            .map_err(|e| TelemetryError::Initialization(e.to_string()))?;
        self.pool.release(worker, channel);
        Ok(())
    }

    fn send(&self, payload: &[u8]) -> Result<(), TelemetryError> {
        if self.pool.is_closed() {
            return Err(TelemetryError::Closed);
        }
        if !self.is_initialized() {
            log::warn!("ReliableQueueTransport is not initialized properly; record dropped.");
            return Err(TelemetryError::NotInitialized);
        }

        let worker = thread::current().id();
        let mut channel = self.pool.acquire(worker)?;
        match channel.publish(self.queue(), payload, true) {
            Ok(()) => {
                self.pool.release(worker, channel);
                Ok(())
            }
            Err(e) if e.invalidates_connection() => {
                log::error!("ReliableQueueTransport failed to publish, dropping connection: {e}");
                let _ = channel.close();
                Err(e)
            }
            Err(e) => {
                self.pool.release(worker, channel);
                Err(e)
            }
        }
    }

    fn close(&self) -> Result<(), TelemetryError> {
        self.pool.close_all()
    }
}

#[cfg(feature = "tokio")]
pub use self::nonblocking::AsyncReliableQueueTransport;

#[cfg(feature = "tokio")]
mod nonblocking {
    use crate::{
        config::BrokerSettings,
        error::TelemetryError,
        transport::{AsyncBrokerChannel, AsyncBrokerConnector, AsyncTransport, BROKER_CONNECTS},
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Mutex;

    /// Broker transport for async code.
    ///
    /// Tasks share one channel; a send holds it for the duration of the
    /// publish. The channel is opened on first use and discarded when a
    /// publish fails, so the next send reconnects.
    pub struct AsyncReliableQueueTransport<C: AsyncBrokerConnector> {
        connector: C,
        settings: BrokerSettings,
        channel: Mutex<Option<C::Channel>>,
        closed: AtomicBool,
    }

    impl<C: AsyncBrokerConnector> AsyncReliableQueueTransport<C> {
        /// # Errors
        /// Returns [`TelemetryError::MissingCredentials`] if the user or password is empty.
        pub fn new(connector: C, settings: BrokerSettings) -> Result<Self, TelemetryError> {
            settings.validate()?;
            Ok(Self {
                connector,
                settings,
                channel: Mutex::new(None),
                closed: AtomicBool::new(false),
            })
        }

        pub fn queue(&self) -> &str {
            &self.settings.queue
        }

        async fn ensure_open(&self, slot: &mut Option<C::Channel>) -> Result<(), TelemetryError> {
            if slot.as_ref().is_some_and(|channel| channel.is_open()) {
                return Ok(());
            }
            if let Some(mut stale) = slot.take() {
                let _ = stale.close().await;
            }
            let mut channel = self.connector.connect(&self.settings).await?;
            channel.declare_queue(&self.settings.queue, true).await?;
            metrics::counter!(BROKER_CONNECTS).increment(1);
            *slot = Some(channel);
            Ok(())
        }
    }

    #[async_trait]
    impl<C: AsyncBrokerConnector> AsyncTransport for AsyncReliableQueueTransport<C> {
        fn name(&self) -> &'static str {
            "broker"
        }

        fn server_name(&self) -> &str {
            &self.settings.server_name
        }

        async fn connect(&self) -> Result<(), TelemetryError> {
            let mut slot = self.channel.lock().await;
            self.ensure_open(&mut slot).await.map_err(|e| {
                log::error!("AsyncReliableQueueTransport initialization failed: {e}");
                TelemetryError::Initialization(e.to_string())
            })
        }

        async fn send(&self, payload: &[u8]) -> Result<(), TelemetryError> {
            if self.closed.load(Ordering::Acquire) {
                return Err(TelemetryError::Closed);
            }
            let mut slot = self.channel.lock().await;
            self.ensure_open(&mut slot).await?;
            let Some(channel) = slot.as_mut() else {
                return Err(TelemetryError::NotInitialized);
            };
            match channel.publish(&self.settings.queue, payload, true).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    if e.invalidates_connection() {
                        log::error!(
                            "AsyncReliableQueueTransport publish failed, dropping connection: {e}"
                        );
                        if let Some(mut broken) = slot.take() {
                            let _ = broken.close().await;
                        }
                    }
                    Err(e)
                }
            }
        }

        async fn close(&self) -> Result<(), TelemetryError> {
            self.closed.store(true, Ordering::Release);
            match self.channel.lock().await.take() {
                Some(mut channel) => channel.close().await,
                None => Ok(()),
            }
        }
    }
}
