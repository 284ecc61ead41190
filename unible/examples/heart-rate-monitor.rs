use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::signal;
use tokio_stream::{Stream, StreamExt, StreamMap};
use uuid::Uuid;

use unible::characteristic::CharacteristicProperties;
use unible::fake::{FakeCharacteristic, FakePeripheral, FakeService, FakeSession};
use unible::ingest::Advertisement;
use unible::uuid::uuid_from_u16;
use unible::{DeviceId, NotifyMode, ScanFilter, SessionConfig};

#[derive(PartialEq, Eq, Hash, Clone, Copy)]
enum EventSource {
    Bluetooth,
    Interrupt, // Ctrl-C handling
}

#[derive(Debug, Clone)]
enum Event {
    BtEvent(unible::Event),
    Interrupt,
}

const HEART_RATE_SERVICE_UUID: Uuid = uuid_from_u16(0x180D);
const HEART_RATE_MEASUREMENT_CHARACTERISTIC_UUID: Uuid = uuid_from_u16(0x2A37);

// Pretends to be a heart rate monitor that advertises until connected and
// then notifies a measurement every second.
fn simulate_monitor(fake: FakeSession, device_id: DeviceId) {
    fake.add_peripheral(device_id, FakePeripheral::new()
        .with_service(FakeService::new(HEART_RATE_SERVICE_UUID)
            .with_characteristic(FakeCharacteristic::new(HEART_RATE_MEASUREMENT_CHARACTERISTIC_UUID,
                                                         CharacteristicProperties::NOTIFY))));

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        let mut bpm = 60u8;
        loop {
            interval.tick().await;

            let mut advertisement = Advertisement::new(device_id);
            advertisement.local_name = Some("Fake HRM".to_string());
            advertisement.service_uuids = vec![HEART_RATE_SERVICE_UUID];
            advertisement.rssi = Some(-60);
            fake.advertise(advertisement);

            fake.notify(device_id, HEART_RATE_SERVICE_UUID,
                        HEART_RATE_MEASUREMENT_CHARACTERISTIC_UUID, vec![0x00, bpm]);
            bpm = if bpm >= 90 { 60 } else { bpm + 1 };
        }
    });
}

fn print_measurement(data: &[u8]) {
    if data.len() < 2 {
        println!("HR: short measurement {:?}", data);
        return;
    }
    let hr = if data[0] & 0x1 == 0x1 && data.len() >= 3 {
        u16::from_le_bytes([data[1], data[2]])
    } else {
        data[1] as u16
    };
    println!("> Heart Rate: {}", hr);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init();

    let fake = FakeSession::new();
    simulate_monitor(fake.clone(), "C0:FF:EE:00:00:01".parse()?);

    let session = SessionConfig::new().set_backend(Arc::new(fake)).start().await?;
    let events = session.events()?;

    let mut filter = ScanFilter::new();
    filter.add_service(HEART_RATE_SERVICE_UUID);
    session.start_scanning(Some(filter)).await?;

    let mut mainloop = StreamMap::new();

    let ctrl_c_stream: Pin<Box<dyn Stream<Item = Event>>> =
        Box::pin(signal::ctrl_c().into_stream().map(|_| {
                                                   println!("Ctrl-C");
                                                   Event::Interrupt
                                               }));
    mainloop.insert(EventSource::Interrupt, ctrl_c_stream);

    let bt_event_stream: Pin<Box<dyn Stream<Item = Event>>> =
        Box::pin(events.map(Event::BtEvent));
    mainloop.insert(EventSource::Bluetooth, bt_event_stream);

    let mut hr_monitor = None;

    // Scan for a heart rate monitor to connect to...
    //
    while let Some((_, event)) = mainloop.next().await {
        match event {
            Event::BtEvent(unible::Event::ScanResult(record)) => {
                println!("Found heart rate monitor: {} / {:?}", record.device_id, record.name);
                hr_monitor = Some(record.device_id);
                break;
            }
            Event::BtEvent(event) => {
                println!("EVENT: {:?}", &event);
            }
            Event::Interrupt => {
                println!("Interrupt received!");
                break;
            }
        }
    }

    session.stop_scanning().await?;

    let hr_monitor = match hr_monitor {
        Some(hr_monitor) => hr_monitor,
        None => return Ok(()),
    };

    session.connect(hr_monitor).await?;
    for service in session.discover_services(hr_monitor)? {
        println!("Service {}: {} characteristics", service.uuid, service.characteristics.len());
    }
    session.set_notifiable(hr_monitor, HEART_RATE_SERVICE_UUID,
                           HEART_RATE_MEASUREMENT_CHARACTERISTIC_UUID, NotifyMode::Notify)
           .await?;

    // Monitoring loop
    while let Some((_, event)) = mainloop.next().await {
        match event {
            Event::BtEvent(unible::Event::ValueChanged { characteristic, value, .. }) => {
                if characteristic == HEART_RATE_MEASUREMENT_CHARACTERISTIC_UUID {
                    print_measurement(&value);
                }
            }
            Event::BtEvent(unible::Event::ConnectionChanged { connected: false, error, .. }) => {
                println!("Heart Rate Monitor Disconnected! {:?}", error);
                break;
            }
            Event::BtEvent(_) => {}
            Event::Interrupt => {
                println!("Interrupt received!");
                break;
            }
        }
    }

    session.disconnect(hr_monitor)?;

    Ok(())
}
