use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::scan::{ManufacturerData, ScanRecord};

/// Matches manufacturer specific advertising data.
///
/// With no `data` any entry with the given company id matches. Otherwise the
/// entry's data must be at least as long as `data` and agree with it on every
/// byte, after masking with the corresponding `mask` byte (bytes past the end
/// of the mask are compared exactly).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManufacturerDataFilter {
    pub company_id: u16,
    pub data: Option<Vec<u8>>,
    pub mask: Option<Vec<u8>>,
}

impl ManufacturerDataFilter {
    pub fn new(company_id: u16) -> Self {
        Self {
            company_id,
            data: None,
            mask: None,
        }
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_mask(mut self, mask: Vec<u8>) -> Self {
        self.mask = Some(mask);
        self
    }

    fn matches(&self, entry: &ManufacturerData) -> bool {
        if entry.company_id != self.company_id {
            return false;
        }
        let pattern = match &self.data {
            Some(pattern) => pattern,
            None => return true,
        };
        if entry.data.len() < pattern.len() {
            return false;
        }
        let mask = self.mask.as_deref().unwrap_or(&[]);
        pattern.iter()
               .zip(entry.data.iter())
               .enumerate()
               .all(|(i, (p, d))| {
                   let m = mask.get(i).copied().unwrap_or(0xFF);
                   m & p == m & d
               })
    }
}

/// Which peripherals a scan should report.
///
/// Each category that has at least one rule is checked independently and a
/// peripheral is reported if it passes any of them. A filter with no rules at
/// all lets everything through.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanFilter {
    pub service_uuids: Vec<Uuid>,
    pub manufacturer_data: Vec<ManufacturerDataFilter>,
    pub name_prefixes: Vec<String>,
}

impl ScanFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_service(&mut self, uuid: Uuid) -> &mut Self {
        self.service_uuids.push(uuid);
        self
    }

    pub fn add_manufacturer_data(&mut self, filter: ManufacturerDataFilter) -> &mut Self {
        self.manufacturer_data.push(filter);
        self
    }

    pub fn add_name_prefix(&mut self, prefix: &str) -> &mut Self {
        self.name_prefixes.push(prefix.to_string());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.service_uuids.is_empty()
        && self.manufacturer_data.is_empty()
        && self.name_prefixes.is_empty()
    }
}

/// A [`ScanFilter`] prepared for matching against many records.
#[derive(Clone, Debug, Default)]
pub struct CompiledFilter {
    service_uuids: HashSet<Uuid>,
    manufacturer_data: Vec<ManufacturerDataFilter>,
    name_prefixes: Vec<String>,
}

impl CompiledFilter {
    pub fn compile(filter: &ScanFilter) -> Self {
        Self {
            service_uuids: filter.service_uuids.iter().copied().collect(),
            manufacturer_data: filter.manufacturer_data.clone(),
            name_prefixes: filter.name_prefixes.clone(),
        }
    }

    pub fn reset(&mut self) {
        self.service_uuids.clear();
        self.manufacturer_data.clear();
        self.name_prefixes.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.service_uuids.is_empty()
        && self.manufacturer_data.is_empty()
        && self.name_prefixes.is_empty()
    }

    pub fn matches(&self, record: &ScanRecord) -> bool {
        if self.is_empty() {
            return true;
        }

        (!self.name_prefixes.is_empty() && self.matches_name(record))
        || (!self.service_uuids.is_empty() && self.matches_services(record))
        || (!self.manufacturer_data.is_empty() && self.matches_manufacturer_data(record))
    }

    fn matches_name(&self, record: &ScanRecord) -> bool {
        match record.name.as_deref() {
            Some(name) if !name.is_empty() => {
                self.name_prefixes.iter().any(|prefix| name.starts_with(prefix.as_str()))
            }
            _ => false,
        }
    }

    fn matches_services(&self, record: &ScanRecord) -> bool {
        record.service_uuids.iter().any(|uuid| self.service_uuids.contains(uuid))
    }

    fn matches_manufacturer_data(&self, record: &ScanRecord) -> bool {
        self.manufacturer_data.iter().any(|filter| {
            record.manufacturer_data.iter().any(|entry| filter.matches(entry))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uuid::uuid_from_u16;
    use crate::DeviceId;

    fn record(name: Option<&str>) -> ScanRecord {
        let mut record = ScanRecord::new(DeviceId::new(0x1122_3344_5566).unwrap());
        record.name = name.map(|n| n.to_string());
        record
    }

    fn with_manufacturer_data(company_id: u16, data: &[u8]) -> ScanRecord {
        let mut record = record(None);
        record.manufacturer_data.push(ManufacturerData { company_id, data: data.to_vec() });
        record
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = CompiledFilter::compile(&ScanFilter::new());
        assert!(filter.matches(&record(None)));
        assert!(filter.matches(&record(Some("anything"))));
    }

    #[test]
    fn name_prefix() {
        let filter = CompiledFilter::compile(ScanFilter::new().add_name_prefix("Foo"));
        assert!(filter.matches(&record(Some("Foobar"))));
        assert!(filter.matches(&record(Some("Foo"))));
        assert!(!filter.matches(&record(Some("Bar"))));
        assert!(!filter.matches(&record(Some("barFoo"))));
        assert!(!filter.matches(&record(None)));
    }

    #[test]
    fn categories_are_ored() {
        let heart_rate = uuid_from_u16(0x180D);
        let battery = uuid_from_u16(0x180F);
        let filter = CompiledFilter::compile(ScanFilter::new().add_name_prefix("Foo")
                                                               .add_service(heart_rate));

        // Only the name matches
        assert!(filter.matches(&record(Some("Foobar"))));

        // Only the service matches
        let mut hrm = record(Some("Bar"));
        hrm.service_uuids.push(heart_rate);
        assert!(filter.matches(&hrm));

        // Neither matches
        let mut other = record(Some("Bar"));
        other.service_uuids.push(battery);
        assert!(!filter.matches(&other));

        // An unconfigured category never matches on its own
        let services_only = CompiledFilter::compile(ScanFilter::new().add_service(heart_rate));
        assert!(!services_only.matches(&record(Some("Foobar"))));
    }

    #[test]
    fn manufacturer_data_masking() {
        let filter = CompiledFilter::compile(ScanFilter::new().add_manufacturer_data(
            ManufacturerDataFilter::new(0x1234).with_data(vec![0xAA]).with_mask(vec![0x0F])));

        assert!(filter.matches(&with_manufacturer_data(0x1234, &[0x1A])));
        assert!(filter.matches(&with_manufacturer_data(0x1234, &[0xFA, 0x00])));
        assert!(!filter.matches(&with_manufacturer_data(0x1234, &[0x2B])));
        assert!(!filter.matches(&with_manufacturer_data(0x4321, &[0x1A])));
        assert!(!filter.matches(&with_manufacturer_data(0x1234, &[])));
    }

    #[test]
    fn manufacturer_data_without_mask_or_pattern() {
        let company_only = CompiledFilter::compile(
            ScanFilter::new().add_manufacturer_data(ManufacturerDataFilter::new(0x004C)));
        assert!(company_only.matches(&with_manufacturer_data(0x004C, &[])));
        assert!(!company_only.matches(&record(Some("iPhone"))));

        // A mask shorter than the pattern compares the remaining bytes exactly
        let short_mask = CompiledFilter::compile(ScanFilter::new().add_manufacturer_data(
            ManufacturerDataFilter::new(0x004C).with_data(vec![0x10, 0x05]).with_mask(vec![0x00])));
        assert!(short_mask.matches(&with_manufacturer_data(0x004C, &[0xFF, 0x05])));
        assert!(!short_mask.matches(&with_manufacturer_data(0x004C, &[0xFF, 0x06])));
    }

    #[test]
    fn reset_clears_all_rules() {
        let mut filter = CompiledFilter::compile(ScanFilter::new().add_name_prefix("Foo"));
        assert!(!filter.matches(&record(Some("Bar"))));
        filter.reset();
        assert!(filter.is_empty());
        assert!(filter.matches(&record(Some("Bar"))));
    }
}
