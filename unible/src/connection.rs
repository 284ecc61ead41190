use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::SystemTime;

use log::{debug, error, trace, warn};
use uuid::Uuid;

use crate::characteristic::{CharacteristicEntry, CharacteristicPath, NotifyMode, WriteType};
use crate::marshaller::EventEmitter;
use crate::service::{ServiceEntry, ServiceInfo};
use crate::session::BackendSession;
use crate::{ConnectionState, DeviceHandle, DeviceId, Error, Event, ListenerToken, Result,
            SubscriptionToken};

/// Everything known about one connected peripheral.
///
/// An agent only exists while its peripheral is connected, it's created once
/// the whole GATT topology has been enumerated and is torn down in one go.
#[derive(Debug)]
pub(crate) struct ConnectionAgent {
    device: DeviceHandle,
    status_listener: ListenerToken,
    gatt_map: HashMap<Uuid, ServiceEntry>,
}

impl ConnectionAgent {
    fn characteristic(&self, service: Uuid, characteristic: Uuid)
                      -> Result<(&ServiceEntry, &CharacteristicEntry)> {
        let service_entry = self.gatt_map.get(&service).ok_or(Error::NotFound)?;
        let characteristic = service_entry.characteristics
                                          .get(&characteristic)
                                          .ok_or(Error::NotFound)?;
        Ok((service_entry, characteristic))
    }

    fn characteristic_mut(&mut self, service: Uuid, characteristic: Uuid)
                          -> Option<&mut CharacteristicEntry> {
        self.gatt_map.get_mut(&service)?.characteristics.get_mut(&characteristic)
    }

    fn path(&self, device_id: DeviceId, service: Uuid, characteristic: Uuid)
            -> Result<(CharacteristicPath, CharacteristicEntry)> {
        let (service_entry, entry) = self.characteristic(service, characteristic)?;
        let path = CharacteristicPath {
            device_id,
            device: self.device,
            service: service_entry.handle,
            service_uuid: service,
            characteristic: entry.handle,
            characteristic_uuid: characteristic,
        };
        Ok((path, entry.clone()))
    }
}

#[derive(Debug, Default)]
struct ConnectionTable {
    agents: HashMap<DeviceId, ConnectionAgent>,

    // Devices with an `open` in flight
    connecting: HashSet<DeviceId>,

    // Characteristics with a `set_notifiable` in flight
    notifying: HashSet<(DeviceId, Uuid, Uuid)>,
}

impl ConnectionTable {
    fn path(&self, device_id: DeviceId, service: Uuid, characteristic: Uuid)
            -> Result<(CharacteristicPath, CharacteristicEntry)> {
        self.agents
            .get(&device_id)
            .ok_or(Error::NotFound)?
            .path(device_id, service, characteristic)
    }
}

/// Owns the [`ConnectionAgent`] of every connected peripheral.
///
/// NB: the table lock is never held across an `.await`, only around the
/// synchronous listener (de)registration calls into the backend.
#[derive(Debug)]
pub(crate) struct ConnectionManager {
    backend: Arc<dyn BackendSession>,
    table: StdMutex<ConnectionTable>,
    emitter: EventEmitter,
}

// Clears the in-flight marker for a device however `open` finishes, including
// if the future is dropped part way through.
struct ConnectingGuard<'a> {
    table: &'a StdMutex<ConnectionTable>,
    device_id: DeviceId,
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        self.table.lock().unwrap().connecting.remove(&self.device_id);
    }
}

struct NotifyingGuard<'a> {
    table: &'a StdMutex<ConnectionTable>,
    key: (DeviceId, Uuid, Uuid),
}

impl Drop for NotifyingGuard<'_> {
    fn drop(&mut self) {
        self.table.lock().unwrap().notifying.remove(&self.key);
    }
}

impl ConnectionManager {
    pub(crate) fn new(backend: Arc<dyn BackendSession>, emitter: EventEmitter) -> Self {
        Self {
            backend,
            table: StdMutex::new(ConnectionTable::default()),
            emitter,
        }
    }

    fn emit_connection_changed(&self, device_id: DeviceId, connected: bool, error: Option<String>) {
        self.emitter.emit(Event::ConnectionChanged {
            device_id,
            connected,
            error,
        });
    }

    /// Connects to a peripheral and caches its whole GATT topology.
    ///
    /// Services whose characteristics can't be enumerated are left out of the
    /// cache rather than failing the connection.
    pub(crate) async fn open(&self, device_id: DeviceId) -> Result<()> {
        {
            let mut table = self.table.lock().unwrap();
            if table.agents.contains_key(&device_id) {
                trace!("Already connected to {}", device_id);
                return Ok(());
            }
            if !table.connecting.insert(device_id) {
                return Err(Error::AlreadyInProgress);
            }
        }
        let guard = ConnectingGuard { table: &self.table, device_id };

        let (device, gatt_map) = match self.discover(device_id).await {
            Ok(discovered) => discovered,
            Err(err) => {
                drop(guard);
                return Err(self.open_failed(device_id, err));
            }
        };

        // The status listener is registered with the table locked so that a
        // link drop reported straight away can only be handled once the agent
        // is in place.
        let mut table = self.table.lock().unwrap();
        let status_listener = match self.backend.register_connection_status(device_id, device) {
            Ok(token) => token,
            Err(err) => {
                self.backend.release_device(device);
                drop(table);
                drop(guard);
                return Err(self.open_failed(device_id, err.into()));
            }
        };
        debug!("Connected to {} with {} services", device_id, gatt_map.len());
        table.agents.insert(device_id,
                            ConnectionAgent {
                                device,
                                status_listener,
                                gatt_map,
                            });
        self.emit_connection_changed(device_id, true, None);
        drop(table);
        drop(guard);

        Ok(())
    }

    fn open_failed(&self, device_id: DeviceId, err: Error) -> Error {
        warn!("Failed to connect to {}: {}", device_id, err);
        self.emit_connection_changed(device_id, false, Some(err.to_string()));
        err
    }

    async fn discover(&self, device_id: DeviceId)
                      -> Result<(DeviceHandle, HashMap<Uuid, ServiceEntry>)> {
        let device = self.backend.resolve_device(device_id).await?;

        let services = match self.backend.discover_services(device).await {
            Ok(services) => services,
            Err(err) => {
                self.backend.release_device(device);
                return Err(err.into());
            }
        };

        let mut gatt_map = HashMap::new();
        for (service_handle, service_uuid) in services {
            let characteristics =
                match self.backend.discover_characteristics(device, service_handle).await {
                    Ok(characteristics) => characteristics,
                    Err(err) => {
                        warn!("Skipping service {} of {}, failed to enumerate characteristics: {}",
                              service_uuid, device_id, err);
                        continue;
                    }
                };

            let mut service = ServiceEntry::new(service_handle);
            for info in characteristics {
                trace!("{}: service {} characteristic {}", device_id, service_uuid, info.uuid);
                service.characteristics.insert(info.uuid, CharacteristicEntry::new(info));
            }
            gatt_map.insert(service_uuid, service);
        }

        Ok((device, gatt_map))
    }

    /// Tears down the connection to a peripheral, if there is one.
    ///
    /// Every listener is revoked and the device released before the
    /// disconnect is reported. Returns whether there was anything to close.
    pub(crate) fn close(&self, device_id: DeviceId, error: Option<String>) -> bool {
        let mut table = self.table.lock().unwrap();
        let agent = match table.agents.remove(&device_id) {
            Some(agent) => agent,
            None => {
                trace!("No connection to close for {}", device_id);
                return false;
            }
        };

        if let Err(err) = self.backend.revoke_connection_status(agent.device, agent.status_listener) {
            error!("Failed to revoke connection status listener for {}: {}", device_id, err);
        }

        for (service_uuid, service) in agent.gatt_map.iter() {
            for (characteristic_uuid, characteristic) in service.characteristics.iter() {
                let token = match characteristic.subscription {
                    Some(token) => token,
                    None => continue,
                };
                let path = CharacteristicPath {
                    device_id,
                    device: agent.device,
                    service: service.handle,
                    service_uuid: *service_uuid,
                    characteristic: characteristic.handle,
                    characteristic_uuid: *characteristic_uuid,
                };
                if let Err(err) = self.backend.revoke_value_changed(&path, token) {
                    error!("Failed to revoke value listener for {}/{}: {}",
                           device_id, characteristic_uuid, err);
                }
            }
        }

        self.backend.release_device(agent.device);
        drop(agent);

        trace!("Connection to {} closed", device_id);
        self.emit_connection_changed(device_id, false, error);
        true
    }

    pub(crate) fn fetch_characteristic(&self, device_id: DeviceId, service: Uuid,
                                       characteristic: Uuid)
                                       -> Result<CharacteristicEntry> {
        let (_, entry) = self.table.lock().unwrap().path(device_id, service, characteristic)?;
        Ok(entry)
    }

    pub(crate) async fn set_notifiable(&self, device_id: DeviceId, service: Uuid,
                                       characteristic: Uuid, mode: NotifyMode)
                                       -> Result<()> {
        let key = (device_id, service, characteristic);
        let path = {
            let mut table = self.table.lock().unwrap();
            let (path, entry) = table.path(device_id, service, characteristic)?;
            entry.check_notify_mode(mode)?;
            // The descriptor write and the listener (de)registration must not
            // interleave with another request for the same characteristic
            if !table.notifying.insert(key) {
                return Err(Error::AlreadyInProgress);
            }
            path
        };
        let guard = NotifyingGuard { table: &self.table, key };

        self.backend.write_client_configuration(&path, mode).await?;

        let mut table = self.table.lock().unwrap();

        // The peripheral may have disconnected (or even reconnected) while the
        // descriptor was being written
        let agent = match table.agents.get_mut(&device_id) {
            Some(agent) if agent.device == path.device => agent,
            _ => return Err(Error::NotFound),
        };
        let entry = agent.characteristic_mut(service, characteristic).ok_or(Error::NotFound)?;

        if let Some(token) = entry.subscription.take() {
            if let Err(err) = self.backend.revoke_value_changed(&path, token) {
                error!("Failed to revoke value listener for {}/{}: {}",
                       device_id, characteristic, err);
            }
        }
        if mode != NotifyMode::Off {
            let token = self.backend.subscribe_value_changed(&path)?;
            entry.subscription = Some(token);
        }
        trace!("{}/{} notify mode {:?}", device_id, characteristic, mode);
        drop(table);
        drop(guard);

        Ok(())
    }

    /// Forwards a value change, provided `token` is still the characteristic's
    /// current subscription.
    pub(crate) fn on_value_changed(&self, device_id: DeviceId, service: Uuid, characteristic: Uuid,
                                   token: SubscriptionToken, value: Vec<u8>) {
        let table = self.table.lock().unwrap();
        let current = table.agents
                           .get(&device_id)
                           .and_then(|agent| agent.characteristic(service, characteristic).ok())
                           .and_then(|(_, entry)| entry.subscription);
        if current != Some(token) {
            trace!("Dropping value change for {}/{} from stale listener {:?}",
                   device_id, characteristic, token);
            return;
        }
        self.emitter.emit(Event::ValueChanged {
            device_id,
            characteristic,
            value,
            timestamp: SystemTime::now(),
        });
    }

    pub(crate) async fn read_value(&self, device_id: DeviceId, service: Uuid,
                                   characteristic: Uuid)
                                   -> Result<Vec<u8>> {
        let (path, entry) = self.table.lock().unwrap().path(device_id, service, characteristic)?;
        entry.check_readable()?;
        Ok(self.backend.read_characteristic(&path).await?)
    }

    pub(crate) async fn write_value(&self, device_id: DeviceId, service: Uuid,
                                    characteristic: Uuid, value: &[u8], write_type: WriteType)
                                    -> Result<()> {
        let (path, entry) = self.table.lock().unwrap().path(device_id, service, characteristic)?;
        entry.check_write_type(write_type)?;
        Ok(self.backend.write_characteristic(&path, write_type, value).await?)
    }

    /// The cached topology of a connected peripheral, in attribute handle order.
    pub(crate) fn discover_services(&self, device_id: DeviceId) -> Result<Vec<ServiceInfo>> {
        let table = self.table.lock().unwrap();
        let agent = table.agents.get(&device_id).ok_or(Error::NotFound)?;

        let mut services: Vec<(&Uuid, &ServiceEntry)> = agent.gatt_map.iter().collect();
        services.sort_by_key(|(_, service)| service.handle);
        Ok(services.into_iter().map(|(uuid, service)| service.info(*uuid)).collect())
    }

    pub(crate) fn connection_state(&self, device_id: DeviceId) -> ConnectionState {
        let table = self.table.lock().unwrap();
        if table.agents.contains_key(&device_id) {
            ConnectionState::Connected
        } else if table.connecting.contains(&device_id) {
            ConnectionState::Connecting
        } else {
            ConnectionState::Disconnected
        }
    }

    pub(crate) async fn request_mtu(&self, device_id: DeviceId) -> Result<u16> {
        let device = {
            let table = self.table.lock().unwrap();
            table.agents.get(&device_id).ok_or(Error::NotFound)?.device
        };
        Ok(self.backend.max_pdu_size(device).await?)
    }

    pub(crate) fn connected_devices(&self) -> Vec<DeviceId> {
        self.table.lock().unwrap().agents.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::characteristic::CharacteristicProperties;
    use crate::fake::session::{FakeCharacteristic, FakePeripheral, FakeService, FakeSession};
    use crate::marshaller::{Dispatcher, Marshaller};
    use crate::uuid::uuid_from_u16;
    use crate::GattError;
    use tokio::sync::broadcast;

    const HEART_RATE: Uuid = uuid_from_u16(0x180D);
    const MEASUREMENT: Uuid = uuid_from_u16(0x2A37);
    const BODY_LOCATION: Uuid = uuid_from_u16(0x2A38);
    const BATTERY: Uuid = uuid_from_u16(0x180F);
    const BATTERY_LEVEL: Uuid = uuid_from_u16(0x2A19);

    struct Harness {
        fake: FakeSession,
        manager: ConnectionManager,
        dispatcher: Dispatcher,
        events: broadcast::Receiver<Event>,
    }

    impl Harness {
        fn new() -> Self {
            let fake = FakeSession::new();
            fake.add_peripheral(device(), heart_rate_monitor());

            let marshaller = Marshaller::new();
            let (event_bus, events) = broadcast::channel(64);
            let dispatcher = marshaller.bind().unwrap();
            let manager = ConnectionManager::new(Arc::new(fake.clone()),
                                                 EventEmitter::new(marshaller, event_bus));
            Self { fake, manager, dispatcher, events }
        }

        fn events(&mut self) -> Vec<Event> {
            self.dispatcher.drain();
            let mut events = vec![];
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }
    }

    fn device() -> DeviceId {
        DeviceId::new(0x00AA_BBCC_DDEE).unwrap()
    }

    fn heart_rate_monitor() -> FakePeripheral {
        FakePeripheral::new()
            .with_service(FakeService::new(HEART_RATE)
                .with_characteristic(FakeCharacteristic::new(MEASUREMENT,
                    CharacteristicProperties::NOTIFY | CharacteristicProperties::INDICATE))
                .with_characteristic(FakeCharacteristic::new(BODY_LOCATION,
                    CharacteristicProperties::READ).with_value(vec![1])))
            .with_service(FakeService::new(BATTERY)
                .with_characteristic(FakeCharacteristic::new(BATTERY_LEVEL,
                    CharacteristicProperties::READ | CharacteristicProperties::NOTIFY)
                    .with_value(vec![87])))
    }

    fn connection_changes(events: &[Event]) -> Vec<(bool, Option<String>)> {
        events.iter().filter_map(|event| match event {
            Event::ConnectionChanged { connected, error, .. } => Some((*connected, error.clone())),
            _ => None,
        }).collect()
    }

    #[tokio::test]
    async fn open_caches_topology() {
        let mut h = Harness::new();
        h.manager.open(device()).await.unwrap();

        assert_eq!(h.manager.connection_state(device()), ConnectionState::Connected);
        assert_eq!(connection_changes(&h.events()), vec![(true, None)]);

        let services = h.manager.discover_services(device()).unwrap();
        assert_eq!(services.iter().map(|s| s.uuid).collect::<Vec<_>>(), vec![HEART_RATE, BATTERY]);
        assert_eq!(services[0].characteristics.len(), 2);

        let entry = h.manager.fetch_characteristic(device(), BATTERY, BATTERY_LEVEL).unwrap();
        assert_eq!(entry.uuid(), BATTERY_LEVEL);
        assert!(!entry.is_subscribed());
        assert!(matches!(h.manager.fetch_characteristic(device(), BATTERY, MEASUREMENT),
                         Err(Error::NotFound)));

        // Already connected
        h.manager.open(device()).await.unwrap();
        assert!(h.events().is_empty());
        assert_eq!(h.fake.status_listeners(), 1);
    }

    #[tokio::test]
    async fn open_unknown_device() {
        let mut h = Harness::new();
        let unknown = DeviceId::new(0x1).unwrap();
        assert!(matches!(h.manager.open(unknown).await, Err(Error::NotFound)));
        assert_eq!(h.manager.connection_state(unknown), ConnectionState::Disconnected);

        let changes = connection_changes(&h.events());
        assert_eq!(changes.len(), 1);
        assert!(!changes[0].0);
        assert!(changes[0].1.is_some());
    }

    #[tokio::test]
    async fn service_enumeration_failure_fails_open() {
        let mut h = Harness::new();
        h.fake.add_peripheral(device(), heart_rate_monitor()
                                          .fail_service_discovery(GattError::Unreachable));

        assert!(matches!(h.manager.open(device()).await, Err(Error::Unreachable)));
        assert!(h.manager.discover_services(device()).is_err());
        assert_eq!(h.fake.status_listeners(), 0);
        assert_eq!(connection_changes(&h.events()).len(), 1);
    }

    #[tokio::test]
    async fn partial_topology() {
        let h = Harness::new();
        let faulty = FakePeripheral::new()
            .with_service(FakeService::new(HEART_RATE)
                .with_characteristic(FakeCharacteristic::new(MEASUREMENT,
                                                             CharacteristicProperties::NOTIFY))
                .fail_characteristic_discovery(GattError::ProtocolError(Some(0x0E))))
            .with_service(FakeService::new(BATTERY)
                .with_characteristic(FakeCharacteristic::new(BATTERY_LEVEL,
                                                             CharacteristicProperties::READ)));
        h.fake.add_peripheral(device(), faulty);

        h.manager.open(device()).await.unwrap();
        let services = h.manager.discover_services(device()).unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].uuid, BATTERY);
        assert!(matches!(h.manager.fetch_characteristic(device(), HEART_RATE, MEASUREMENT),
                         Err(Error::NotFound)));
    }

    #[tokio::test]
    async fn duplicate_open_rejected() {
        let h = Harness::new();
        h.fake.set_connect_delay(std::time::Duration::from_millis(50));

        let (first, second) = tokio::join!(h.manager.open(device()), async {
            tokio::task::yield_now().await;
            assert_eq!(h.manager.connection_state(device()), ConnectionState::Connecting);
            h.manager.open(device()).await
        });
        first.unwrap();
        assert!(matches!(second, Err(Error::AlreadyInProgress)));
        assert_eq!(h.fake.status_listeners(), 1);
    }

    #[tokio::test]
    async fn subscription_idempotence() {
        let mut h = Harness::new();
        h.manager.open(device()).await.unwrap();

        for _ in 0..3 {
            h.manager.set_notifiable(device(), HEART_RATE, MEASUREMENT, NotifyMode::Notify)
                     .await
                     .unwrap();
        }
        assert_eq!(h.fake.value_listeners(), 1);
        assert_eq!(h.fake.client_configuration(device(), HEART_RATE, MEASUREMENT),
                   Some(NotifyMode::Notify));
        assert!(h.manager.fetch_characteristic(device(), HEART_RATE, MEASUREMENT)
                         .unwrap()
                         .is_subscribed());

        let revoked = h.fake.revoked_value_listeners();
        assert!(h.manager.close(device(), None));
        assert_eq!(h.fake.revoked_value_listeners(), revoked + 1);
        assert_eq!(h.fake.value_listeners(), 0);

        let changes = connection_changes(&h.events());
        assert_eq!(changes, vec![(true, None), (false, None)]);
    }

    #[tokio::test]
    async fn concurrent_notify_changes_rejected() {
        let h = Harness::new();
        h.manager.open(device()).await.unwrap();

        h.fake.set_descriptor_write_delay(std::time::Duration::from_millis(50));
        let (first, second) = tokio::join!(
            h.manager.set_notifiable(device(), HEART_RATE, MEASUREMENT, NotifyMode::Notify),
            async {
                tokio::task::yield_now().await;
                h.manager.set_notifiable(device(), HEART_RATE, MEASUREMENT, NotifyMode::Off).await
            });
        first.unwrap();
        assert!(matches!(second, Err(Error::AlreadyInProgress)));

        // The descriptor and the listener agree
        assert_eq!(h.fake.client_configuration(device(), HEART_RATE, MEASUREMENT),
                   Some(NotifyMode::Notify));
        assert_eq!(h.fake.value_listeners(), 1);

        // Other characteristics aren't held up, and the marker is cleared
        h.fake.set_descriptor_write_delay(std::time::Duration::from_millis(0));
        h.manager.set_notifiable(device(), BATTERY, BATTERY_LEVEL, NotifyMode::Notify).await.unwrap();
        h.manager.set_notifiable(device(), HEART_RATE, MEASUREMENT, NotifyMode::Off).await.unwrap();
        assert_eq!(h.fake.value_listeners(), 1);
        assert_eq!(h.fake.client_configuration(device(), HEART_RATE, MEASUREMENT),
                   Some(NotifyMode::Off));
    }

    #[tokio::test]
    async fn notify_off() {
        let h = Harness::new();
        h.manager.open(device()).await.unwrap();

        // Nothing to revoke yet
        h.manager.set_notifiable(device(), HEART_RATE, MEASUREMENT, NotifyMode::Off).await.unwrap();
        assert_eq!(h.fake.revoked_value_listeners(), 0);

        h.manager.set_notifiable(device(), HEART_RATE, MEASUREMENT, NotifyMode::Indicate)
                 .await
                 .unwrap();
        h.manager.set_notifiable(device(), HEART_RATE, MEASUREMENT, NotifyMode::Off).await.unwrap();
        assert_eq!(h.fake.value_listeners(), 0);
        assert_eq!(h.fake.revoked_value_listeners(), 1);
        assert!(!h.manager.fetch_characteristic(device(), HEART_RATE, MEASUREMENT)
                          .unwrap()
                          .is_subscribed());
    }

    #[tokio::test]
    async fn unsupported_mode_rejected_before_backend() {
        let h = Harness::new();
        h.manager.open(device()).await.unwrap();

        let result = h.manager.set_notifiable(device(), HEART_RATE, BODY_LOCATION,
                                              NotifyMode::Notify).await;
        assert!(matches!(result, Err(Error::NotSupported("notify"))));
        assert_eq!(h.fake.client_configuration(device(), HEART_RATE, BODY_LOCATION), None);

        let result = h.manager.set_notifiable(device(), BATTERY, BATTERY_LEVEL,
                                              NotifyMode::Indicate).await;
        assert!(matches!(result, Err(Error::NotSupported("indicate"))));
        assert_eq!(h.fake.value_listeners(), 0);
    }

    #[tokio::test]
    async fn teardown_continues_past_revocation_failures() {
        let mut h = Harness::new();
        h.manager.open(device()).await.unwrap();
        h.manager.set_notifiable(device(), HEART_RATE, MEASUREMENT, NotifyMode::Notify)
                 .await
                 .unwrap();
        h.manager.set_notifiable(device(), BATTERY, BATTERY_LEVEL, NotifyMode::Notify)
                 .await
                 .unwrap();
        h.events();

        h.fake.set_fail_revocations(true);
        assert!(h.manager.close(device(), Some("link lost".to_string())));

        assert_eq!(h.fake.released_devices(), 1);
        assert_eq!(h.manager.connection_state(device()), ConnectionState::Disconnected);
        assert!(matches!(h.manager.discover_services(device()), Err(Error::NotFound)));
        assert_eq!(connection_changes(&h.events()),
                   vec![(false, Some("link lost".to_string()))]);

        // Nothing left to close
        assert!(!h.manager.close(device(), None));
        assert!(h.events().is_empty());
    }

    #[tokio::test]
    async fn value_changes_only_from_current_subscription() {
        let mut h = Harness::new();
        h.manager.open(device()).await.unwrap();
        h.manager.set_notifiable(device(), HEART_RATE, MEASUREMENT, NotifyMode::Notify)
                 .await
                 .unwrap();
        let token = h.manager
                     .fetch_characteristic(device(), HEART_RATE, MEASUREMENT)
                     .unwrap()
                     .subscription()
                     .unwrap();
        h.events();

        h.manager.on_value_changed(device(), HEART_RATE, MEASUREMENT, token, vec![0x06, 72]);
        h.manager.on_value_changed(device(), HEART_RATE, MEASUREMENT,
                                   SubscriptionToken(token.0 + 1000), vec![0xFF]);
        let events = h.events();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Event::ValueChanged { value, characteristic, .. }
                         if value == &vec![0x06, 72] && *characteristic == MEASUREMENT));

        h.manager.close(device(), None);
        h.events();
        h.manager.on_value_changed(device(), HEART_RATE, MEASUREMENT, token, vec![0x06, 80]);
        assert!(h.events().is_empty());
    }

    #[tokio::test]
    async fn read_write_and_mtu() {
        let h = Harness::new();
        h.manager.open(device()).await.unwrap();

        assert_eq!(h.manager.read_value(device(), BATTERY, BATTERY_LEVEL).await.unwrap(), vec![87]);
        assert!(matches!(h.manager.read_value(device(), HEART_RATE, MEASUREMENT).await,
                         Err(Error::NotSupported("read"))));
        assert!(matches!(h.manager.write_value(device(), BATTERY, BATTERY_LEVEL, &[1],
                                               WriteType::WithResponse).await,
                         Err(Error::NotSupported("write"))));

        assert_eq!(h.manager.request_mtu(device()).await.unwrap(), 23);
        assert!(matches!(h.manager.request_mtu(DeviceId::new(2).unwrap()).await,
                         Err(Error::NotFound)));
    }
}
