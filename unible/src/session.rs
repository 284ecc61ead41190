use async_trait::async_trait;
use dashmap::DashSet;
use futures::{Stream, StreamExt};
use log::{debug, info, trace, warn};
use std::hash::Hash;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::RwLock as StdRwLock;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::characteristic::{CharacteristicEntry, CharacteristicInfo, CharacteristicPath, NotifyMode,
                            WriteType};
use crate::connection::ConnectionManager;
use crate::fake::session::FakeSession;
use crate::filter::ScanFilter;
use crate::ingest::{Advertisement, DeviceRegistry, RegistryEvent};
use crate::marshaller::{Dispatcher, EventEmitter, Marshaller};
use crate::scan::{ScanRecord, ScanResultMerger};
use crate::service::ServiceInfo;
use crate::{AvailabilityState, BackendEvent, ConnectionState, DeviceHandle, DeviceId, Error, Event,
            GattResult, ListenerToken, Result, ServiceHandle, SubscriptionToken};

use anyhow::anyhow;

const DEFAULT_EVENT_CAPACITY: usize = 64;
const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(10);

/// Supplies a PIN when a pairing ceremony asks for keyboard entry.
#[async_trait]
pub trait PinEntry: Send + Sync {
    /// Returns `None` if the user cancelled.
    async fn request_pin(&self) -> Option<String>;
}

// Note the GATT entry points generally provide the full heirarchy of
// associated handles (device -> service -> characteristic) so that a backend
// doesn't have to track those relationships itself.
//
// Listener registration is synchronous, everything that involves talking to
// a peripheral is async.
#[async_trait]
pub trait BackendSession: Send + Sync + std::fmt::Debug {
    /// Called once as the session starts, with the sender end of the bus that
    /// the backend should push all of its events onto.
    fn start(&self, backend_bus: mpsc::UnboundedSender<BackendEvent>) -> Result<()>;

    fn availability(&self) -> AvailabilityState;

    /// Installs both the advertisement and device registry watchers.
    fn start_scan(&self, filter: &ScanFilter) -> Result<()>;

    /// Revokes both watchers, resolving once they have stopped.
    async fn stop_scan(&self) -> Result<()>;

    async fn resolve_device(&self, device_id: DeviceId) -> GattResult<DeviceHandle>;

    async fn discover_services(&self, device: DeviceHandle) -> GattResult<Vec<(ServiceHandle, Uuid)>>;

    async fn discover_characteristics(&self, device: DeviceHandle, service: ServiceHandle)
                                      -> GattResult<Vec<CharacteristicInfo>>;

    async fn read_characteristic(&self, path: &CharacteristicPath) -> GattResult<Vec<u8>>;

    async fn write_characteristic(&self, path: &CharacteristicPath, write_type: WriteType,
                                  data: &[u8])
                                  -> GattResult<()>;

    async fn write_client_configuration(&self, path: &CharacteristicPath, mode: NotifyMode)
                                        -> GattResult<()>;

    /// Value changes for the characteristic are pushed as
    /// [`BackendEvent::ValueChanged`] carrying the returned token, until it is
    /// revoked.
    fn subscribe_value_changed(&self, path: &CharacteristicPath) -> GattResult<SubscriptionToken>;
    fn revoke_value_changed(&self, path: &CharacteristicPath, token: SubscriptionToken)
                            -> GattResult<()>;

    /// Connection status changes are pushed as
    /// [`BackendEvent::ConnectionStatusChanged`] until the token is revoked.
    fn register_connection_status(&self, device_id: DeviceId, device: DeviceHandle)
                                  -> GattResult<ListenerToken>;
    fn revoke_connection_status(&self, device: DeviceHandle, token: ListenerToken)
                                -> GattResult<()>;

    /// Drops the backend's reference to a device, which closes the link once
    /// nothing else in the system is using it.
    fn release_device(&self, device: DeviceHandle);

    async fn max_pdu_size(&self, device: DeviceHandle) -> GattResult<u16>;

    /// Devices connected at the system level, including by other
    /// applications. An empty `with_services` means no service filtering.
    async fn system_connected_devices(&self, with_services: &[Uuid]) -> GattResult<Vec<ScanRecord>>;

    async fn is_paired(&self, device_id: DeviceId) -> GattResult<bool>;
    async fn pair(&self, device_id: DeviceId, pin_entry: Option<Arc<dyn PinEntry>>)
                  -> GattResult<()>;
    async fn unpair(&self, device_id: DeviceId) -> GattResult<()>;

    /// Pushes [`BackendEvent::Flush`] with the given id once every event
    /// queued before it.
    fn flush(&self, id: u32) -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct Session {
    inner: Arc<SessionInner>,
}
impl PartialEq for Session {
    fn eq(&self, other: &Session) -> bool {
        Arc::<SessionInner>::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for Session {}
impl Hash for Session {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::<SessionInner>::as_ptr(&self.inner), state);
    }
}
impl Deref for Session {
    type Target = SessionInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

// public for the sake of implementing Deref for ergonomics but since
// no members are public and there's not public API for SessionInner
// we don't really leak anything
pub struct SessionInner {
    // The public-facing event stream, only ever fed via the marshaller
    event_bus: broadcast::Sender<Event>,
    marshaller: Marshaller,
    emitter: EventEmitter,
    next_flush_index: AtomicU32,

    backend: Arc<dyn BackendSession>,
    pin_entry: Option<Arc<dyn PinEntry>>,
    sync_timeout: Duration,

    // Note: we have a (tokio) mutex here to synchronize while starting/stopping
    // scanning, not just for maintaining this is_scanning itself, so this can't
    // just be an AtomicBool
    is_scanning: Mutex<bool>,

    // Checked by the backend task for each ingest event. Cleared as soon as a
    // stop begins so nothing is merged into a store that's about to be reset.
    accepting_scan_results: AtomicBool,
    stopping: AtomicBool,

    scan_results: ScanResultMerger,
    registry: DeviceRegistry,
    connections: ConnectionManager,

    // The last availability reported to the application
    availability: StdRwLock<AvailabilityState>,

    pairing: DashSet<DeviceId>,
}

impl std::fmt::Debug for SessionInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionInner")
         .field("backend", &self.backend)
         .field("sync_timeout", &self.sync_timeout)
         .field("marshaller", &self.marshaller)
         .finish()
    }
}

pub struct SessionConfig {
    backend: Option<Arc<dyn BackendSession>>,
    event_capacity: usize,
    sync_timeout: Duration,
    pin_entry: Option<Arc<dyn PinEntry>>,
    manual_dispatch: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionConfig {
    pub fn new() -> SessionConfig {
        SessionConfig {
            backend: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
            pin_entry: None,
            manual_dispatch: false,
        }
    }

    /// Without a backend the session runs against an empty
    /// [`FakeSession`].
    pub fn set_backend(&mut self, backend: Arc<dyn BackendSession>) -> &mut Self {
        self.backend = Some(backend);
        self
    }

    /// How many events can be buffered for a slow event stream before it
    /// starts missing events.
    pub fn set_event_capacity(&mut self, capacity: usize) -> &mut Self {
        self.event_capacity = capacity;
        self
    }

    /// Bounds pairing requests, which would otherwise wait on the platform
    /// (and possibly the user) indefinitely.
    pub fn set_sync_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.sync_timeout = timeout;
        self
    }

    pub fn set_pin_entry(&mut self, pin_entry: Arc<dyn PinEntry>) -> &mut Self {
        self.pin_entry = Some(pin_entry);
        self
    }

    /// Don't spawn a task to deliver events. The application must take the
    /// dispatcher with [`Session::bind_dispatcher`] and drive it from its own
    /// event loop; events are buffered until then.
    pub fn manual_dispatch(&mut self) -> &mut Self {
        self.manual_dispatch = true;
        self
    }

    pub async fn start(&mut self) -> Result<Session> {
        Session::start(self).await
    }
}

// Removes a device from the set of in-flight pairing requests however the
// request finishes.
struct PairingGuard<'a> {
    pairing: &'a DashSet<DeviceId>,
    device_id: DeviceId,
}

impl Drop for PairingGuard<'_> {
    fn drop(&mut self) {
        self.pairing.remove(&self.device_id);
    }
}

// Clears the stop-in-progress flag, even if the caller gives up on a stop
// (e.g. via a timeout) while the backend is still stopping.
struct StoppingGuard<'a>(&'a AtomicBool);

impl Drop for StoppingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Session {
    // Rebuilds a handle from an upgraded Weak, see run_backend_task.
    fn wrap(inner: Arc<SessionInner>) -> Self {
        Self { inner }
    }

    async fn start(config: &SessionConfig) -> Result<Self> {
        let (broadcast_sender, _) = broadcast::channel(config.event_capacity);
        let marshaller = Marshaller::new();
        let emitter = EventEmitter::new(marshaller.clone(), broadcast_sender.clone());

        // The backend is responsible for feeding the backend event bus and
        // then we handle state tracking and forwarding corresponding events to
        // the application as necessary
        let (backend_bus_tx, backend_bus_rx) = mpsc::unbounded_channel();
        let backend = match &config.backend {
            Some(backend) => backend.clone(),
            None => Arc::new(FakeSession::new()) as Arc<dyn BackendSession>,
        };
        backend.start(backend_bus_tx)?;
        let availability = backend.availability();

        let session =
            Session { inner: Arc::new(SessionInner { event_bus: broadcast_sender,
                                                     marshaller: marshaller.clone(),
                                                     emitter: emitter.clone(),
                                                     next_flush_index: AtomicU32::new(0),
                                                     backend: backend.clone(),
                                                     pin_entry: config.pin_entry.clone(),
                                                     sync_timeout: config.sync_timeout,
                                                     is_scanning: Mutex::new(false),
                                                     accepting_scan_results: AtomicBool::new(false),
                                                     stopping: AtomicBool::new(false),
                                                     scan_results: ScanResultMerger::new(emitter.clone()),
                                                     registry: DeviceRegistry::new(),
                                                     connections: ConnectionManager::new(backend, emitter),
                                                     availability: StdRwLock::new(availability),
                                                     pairing: DashSet::new(),
                                                    }) };

        if !config.manual_dispatch {
            marshaller.bind()?.spawn();
        }

        // The backend task only holds a Weak reference so that dropping the last
        // Session handle tears everything down. It upgrades per event and exits
        // once the backend bus closes.
        let weak_session = Arc::downgrade(&session.inner);
        tokio::spawn(async move { Session::run_backend_task(weak_session, backend_bus_rx).await });

        info!("Session started, bluetooth {:?}", availability);
        Ok(session)
    }

    fn on_advertisement(&self, advertisement: Advertisement) {
        if !self.accepting_scan_results.load(Ordering::SeqCst) {
            trace!("Ignoring advertisement from {} while not scanning", advertisement.device_id);
            return;
        }
        let connectable = advertisement.connectable;
        self.scan_results.ingest(advertisement.into_candidate(), connectable);
    }

    fn on_registry_event(&self, event: RegistryEvent) {
        if !self.accepting_scan_results.load(Ordering::SeqCst) {
            trace!("Ignoring device registry event while not scanning");
            return;
        }
        if let Some((candidate, connectable)) = self.registry.handle_event(event) {
            self.scan_results.ingest(candidate, connectable);
        }
    }

    fn on_connection_status_changed(&self, device_id: DeviceId, connected: bool) {
        if connected {
            trace!("{} reports connected", device_id);
            return;
        }
        if !self.connections.close(device_id, None) {
            warn!("Spurious disconnect notification for {}", device_id);
        }
    }

    fn on_availability_changed(&self, state: AvailabilityState) {
        let mut availability = self.availability.write().unwrap();
        if *availability == state {
            trace!("Redundant availability change {:?}", state);
            return;
        }
        debug!("Bluetooth availability {:?} -> {:?}", *availability, state);
        *availability = state;
        self.emitter.emit(Event::AvailabilityChanged(state));
    }

    async fn run_backend_task(weak_session_inner: Weak<SessionInner>,
                              backend_bus: mpsc::UnboundedReceiver<BackendEvent>) {
        trace!("Backend event task started");

        let stream = tokio_stream::wrappers::UnboundedReceiverStream::new(backend_bus);
        tokio::pin!(stream);
        while let Some(event) = stream.next().await {
            let session = match weak_session_inner.upgrade() {
                Some(strong_inner) => Session::wrap(strong_inner),
                None => {
                    trace!("Session dropped, stopping backend event task");
                    break;
                }
            };

            match event {
                BackendEvent::Advertisement(advertisement) => {
                    session.on_advertisement(advertisement);
                }
                BackendEvent::Registry(event) => {
                    session.on_registry_event(event);
                }
                BackendEvent::ConnectionStatusChanged { device_id, connected } => {
                    session.on_connection_status_changed(device_id, connected);
                }
                BackendEvent::ValueChanged { device_id, service, characteristic, token, value } => {
                    session.connections
                           .on_value_changed(device_id, service, characteristic, token, value);
                }
                BackendEvent::AvailabilityChanged(state) => {
                    session.on_availability_changed(state);
                }
                BackendEvent::Flush(id) => {
                    trace!("backend flush {} received", id);
                    session.emitter.emit(Event::Flush(id));
                }
            }
        }

        trace!("Backend event task finished");
    }

    /// Returns a stream of everything reported to the application: scan
    /// results, connection changes, value changes, pairing results,
    /// availability changes and flush markers, in the order they were
    /// marshalled.
    pub fn events(&self) -> Result<impl Stream<Item = Event>> {
        let receiver = self.event_bus.subscribe();
        Ok(BroadcastStream::new(receiver).filter_map(|x| async move {
                                             if let Ok(x) = x {
                                                 Some(x)
                                             } else {
                                                 None
                                             }
                                         }))
    }

    /// Takes the event dispatcher of a session configured with
    /// [`SessionConfig::manual_dispatch`].
    pub fn bind_dispatcher(&self) -> Result<Dispatcher> {
        self.marshaller.bind()
    }

    /// Requests an [`Event::Flush`] with the returned id, which will be
    /// delivered after every event that resulted from backend activity before
    /// this call.
    pub fn flush(&self) -> Result<u32> {
        let id = self.next_flush_index.fetch_add(1, Ordering::SeqCst);
        self.backend.flush(id)?;
        Ok(id)
    }

    pub fn availability_state(&self) -> AvailabilityState {
        self.backend.availability()
    }

    fn ensure_powered_on(&self) -> Result<()> {
        match self.backend.availability() {
            AvailabilityState::PoweredOn => Ok(()),
            state => {
                debug!("Bluetooth not available: {:?}", state);
                Err(Error::BluetoothUnavailable)
            }
        }
    }

    /// Starts scanning for peripherals, according to the given filter (or
    /// reporting everything without one).
    ///
    /// Note: It's an error to try and initiate multiple scans in parallel
    pub async fn start_scanning(&self, filter: Option<ScanFilter>) -> Result<()> {
        self.ensure_powered_on()?;

        let mut is_scanning_guard = self.is_scanning.lock().await;
        if *is_scanning_guard {
            return Err(anyhow!("Already scanning").into());
        }

        let filter = filter.unwrap_or_default();
        self.scan_results.set_filter(&filter);
        self.accepting_scan_results.store(true, Ordering::SeqCst);
        if let Err(err) = self.backend.start_scan(&filter) {
            self.accepting_scan_results.store(false, Ordering::SeqCst);
            self.scan_results.reset();
            return Err(err);
        }
        *is_scanning_guard = true;
        trace!("Scanning started");

        Ok(())
    }

    /// Stops scanning and forgets every scan result.
    pub async fn stop_scanning(&self) -> Result<()> {
        self.ensure_powered_on()?;

        if self.stopping.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyInProgress);
        }
        let _guard = StoppingGuard(&self.stopping);
        self.stop_scanning_locked().await
    }

    async fn stop_scanning_locked(&self) -> Result<()> {
        let mut is_scanning_guard = self.is_scanning.lock().await;
        if !*is_scanning_guard {
            return Err(anyhow!("Not currently scanning").into());
        }

        self.accepting_scan_results.store(false, Ordering::SeqCst);
        let result = self.backend.stop_scan().await;

        // Whatever the backend says, the scan session is over as far as the
        // application is concerned
        *is_scanning_guard = false;
        self.scan_results.reset();
        self.registry.clear();
        trace!("Scanning stopped");

        result
    }

    pub async fn is_scanning(&self) -> bool {
        *self.is_scanning.lock().await
    }

    /// A snapshot of every peripheral seen in the current scan session.
    pub fn scan_results(&self) -> Vec<ScanRecord> {
        self.scan_results.records()
    }

    pub fn scan_result(&self, device_id: DeviceId) -> Option<ScanRecord> {
        self.scan_results.get(device_id)
    }

    /// Connects to a peripheral and discovers all of its services and
    /// characteristics. An [`Event::ConnectionChanged`] is reported either way.
    pub async fn connect(&self, device_id: DeviceId) -> Result<()> {
        self.connections.open(device_id).await
    }

    /// Disconnecting a peripheral that isn't connected does nothing.
    pub fn disconnect(&self, device_id: DeviceId) -> Result<()> {
        self.connections.close(device_id, None);
        Ok(())
    }

    pub fn connection_state(&self, device_id: DeviceId) -> ConnectionState {
        self.connections.connection_state(device_id)
    }

    /// Devices connected through this session.
    pub fn connected_devices(&self) -> Vec<DeviceId> {
        self.connections.connected_devices()
    }

    /// Devices the system reports as connected, whoever connected them,
    /// optionally narrowed to those exposing at least one of `with_services`.
    ///
    /// The records carry whatever the system knows (typically the name and
    /// paired status) and are not added to the scan results.
    pub async fn system_connected_devices(&self, with_services: &[Uuid]) -> Result<Vec<ScanRecord>> {
        self.ensure_powered_on()?;
        self.with_sync_timeout(self.backend.system_connected_devices(with_services)).await
    }

    pub fn discover_services(&self, device_id: DeviceId) -> Result<Vec<ServiceInfo>> {
        self.connections.discover_services(device_id)
    }

    pub fn characteristic(&self, device_id: DeviceId, service: Uuid, characteristic: Uuid)
                          -> Result<CharacteristicEntry> {
        self.connections.fetch_characteristic(device_id, service, characteristic)
    }

    pub async fn set_notifiable(&self, device_id: DeviceId, service: Uuid, characteristic: Uuid,
                                mode: NotifyMode)
                                -> Result<()> {
        self.connections.set_notifiable(device_id, service, characteristic, mode).await
    }

    pub async fn read_value(&self, device_id: DeviceId, service: Uuid, characteristic: Uuid)
                            -> Result<Vec<u8>> {
        self.connections.read_value(device_id, service, characteristic).await
    }

    pub async fn write_value(&self, device_id: DeviceId, service: Uuid, characteristic: Uuid,
                             value: &[u8], write_type: WriteType)
                             -> Result<()> {
        self.connections.write_value(device_id, service, characteristic, value, write_type).await
    }

    /// The largest PDU the link to a connected peripheral supports.
    pub async fn request_mtu(&self, device_id: DeviceId) -> Result<u16> {
        self.connections.request_mtu(device_id).await
    }

    async fn with_sync_timeout<T>(&self, request: impl std::future::Future<Output = GattResult<T>>)
                                  -> Result<T> {
        match tokio::time::timeout(self.sync_timeout, request).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::Timeout),
        }
    }

    pub async fn is_paired(&self, device_id: DeviceId) -> Result<bool> {
        self.with_sync_timeout(self.backend.is_paired(device_id)).await
    }

    /// Pairs with a peripheral, asking the configured [`PinEntry`] for a PIN
    /// if the ceremony needs one. The outcome is also reported as an
    /// [`Event::PairStateChanged`].
    pub async fn pair(&self, device_id: DeviceId) -> Result<()> {
        if !self.pairing.insert(device_id) {
            return Err(Error::AlreadyInProgress);
        }
        let _guard = PairingGuard { pairing: &self.pairing, device_id };

        let result = self.with_sync_timeout(self.backend.pair(device_id, self.pin_entry.clone()))
                         .await;
        self.emitter.emit(Event::PairStateChanged {
            device_id,
            paired: result.is_ok(),
            error: result.as_ref().err().map(|err| err.to_string()),
        });
        result
    }

    pub async fn unpair(&self, device_id: DeviceId) -> Result<()> {
        let result = self.with_sync_timeout(self.backend.unpair(device_id)).await;
        match &result {
            Ok(()) => self.emitter.emit(Event::PairStateChanged {
                device_id,
                paired: false,
                error: None,
            }),
            Err(err) => warn!("Failed to unpair {}: {}", device_id, err),
        }
        result
    }
}
