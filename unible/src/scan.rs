use std::collections::HashMap;
use std::sync::RwLock as StdRwLock;
use std::time::SystemTime;

use log::trace;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::filter::{CompiledFilter, ScanFilter};
use crate::marshaller::EventEmitter;
use crate::{DeviceId, Event};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManufacturerData {
    pub company_id: u16,
    pub data: Vec<u8>,
}

/// Everything known about a peripheral seen while scanning.
///
/// Apart from the `device_id` every field may be missing, which means
/// "unknown" rather than "false" or "none".
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRecord {
    pub device_id: DeviceId,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub is_paired: Option<bool>,
    pub manufacturer_data: Vec<ManufacturerData>,
    pub service_uuids: Vec<Uuid>,
    pub service_data: HashMap<Uuid, Vec<u8>>,
    pub last_seen: SystemTime,
}

impl ScanRecord {
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            name: None,
            rssi: None,
            is_paired: None,
            manufacturer_data: vec![],
            service_uuids: vec![],
            service_data: HashMap::new(),
            last_seen: SystemTime::now(),
        }
    }

    /// Folds a newer sighting of the same device into this record, returning
    /// whether anything changed.
    ///
    /// Fields that the candidate knows about replace what was known before,
    /// fields it doesn't know about are left alone so a record only ever fills
    /// up. The one exception is the name: of two non-empty names the longer one
    /// is kept, since peripherals often advertise a shortened local name while
    /// the system knows the complete one.
    fn merge(&mut self, candidate: ScanRecord) -> bool {
        let mut changed = false;

        if let Some(name) = candidate.name.filter(|name| !name.is_empty()) {
            let keep_existing = match &self.name {
                Some(existing) => {
                    existing == &name || existing.chars().count() > name.chars().count()
                }
                None => false,
            };
            if !keep_existing {
                self.name = Some(name);
                changed = true;
            }
        }

        if candidate.rssi.is_some() && candidate.rssi != self.rssi {
            self.rssi = candidate.rssi;
            changed = true;
        }

        // Whichever source reported last wins, there's no precedence between
        // advertisements and the device registry.
        if candidate.is_paired.is_some() && candidate.is_paired != self.is_paired {
            self.is_paired = candidate.is_paired;
            changed = true;
        }

        if !candidate.manufacturer_data.is_empty()
           && candidate.manufacturer_data != self.manufacturer_data
        {
            self.manufacturer_data = candidate.manufacturer_data;
            changed = true;
        }

        if !candidate.service_uuids.is_empty() && candidate.service_uuids != self.service_uuids {
            self.service_uuids = candidate.service_uuids;
            changed = true;
        }

        if !candidate.service_data.is_empty() && candidate.service_data != self.service_data {
            self.service_data = candidate.service_data;
            changed = true;
        }

        changed
    }
}

#[derive(Debug)]
struct StoredRecord {
    record: ScanRecord,

    // Whether this record has been reported at all. A device whose first
    // sightings were not connectable (or filtered out) still gets reported
    // the first time it's seen connectable and matching.
    emitted: bool,
}

/// The authoritative store of scan results for one scan session.
///
/// Both ingest paths (advertisements and the device registry) funnel into
/// [`ScanResultMerger::ingest`], which is the only way records are modified.
#[derive(Debug)]
pub struct ScanResultMerger {
    records: StdRwLock<HashMap<DeviceId, StoredRecord>>,
    filter: StdRwLock<CompiledFilter>,
    emitter: EventEmitter,
}

impl ScanResultMerger {
    pub(crate) fn new(emitter: EventEmitter) -> Self {
        Self {
            records: StdRwLock::new(HashMap::new()),
            filter: StdRwLock::new(CompiledFilter::default()),
            emitter,
        }
    }

    /// Replaces the filter wholesale, for a new scan session.
    pub fn set_filter(&self, filter: &ScanFilter) {
        *self.filter.write().unwrap() = CompiledFilter::compile(filter);
    }

    pub fn clear(&self) {
        self.records.write().unwrap().clear();
    }

    /// Forgets every record and filter rule, when scanning stops.
    pub fn reset(&self) {
        self.clear();
        self.filter.write().unwrap().reset();
    }

    pub fn ingest(&self, mut candidate: ScanRecord, connectable: bool) {
        let now = SystemTime::now();
        candidate.last_seen = now;

        let device_id = candidate.device_id;

        // NB: emission happens while the store is still locked so that
        // concurrent merges for the same device are reported in the order they
        // were merged. Posting to the marshaller never blocks.
        let mut records = self.records.write().unwrap();
        match records.get_mut(&device_id) {
            None => {
                let emit = connectable && self.filter.read().unwrap().matches(&candidate);
                trace!("New scan record {}: connectable={}, emit={}", device_id, connectable, emit);
                if emit {
                    self.emitter.emit(Event::ScanResult(candidate.clone()));
                }
                records.insert(device_id, StoredRecord {
                    record: candidate,
                    emitted: emit,
                });
            }
            Some(stored) => {
                let changed = stored.record.merge(candidate);
                stored.record.last_seen = now;

                if !changed && stored.emitted {
                    return;
                }
                if connectable && self.filter.read().unwrap().matches(&stored.record) {
                    trace!("Scan record {} updated", device_id);
                    stored.emitted = true;
                    self.emitter.emit(Event::ScanResult(stored.record.clone()));
                }
            }
        }
    }

    pub fn get(&self, device_id: DeviceId) -> Option<ScanRecord> {
        self.records.read().unwrap().get(&device_id).map(|stored| stored.record.clone())
    }

    pub fn records(&self) -> Vec<ScanRecord> {
        self.records.read().unwrap().values().map(|stored| stored.record.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
