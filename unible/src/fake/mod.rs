//! A deterministic, in-process backend.
//!
//! Peripherals are declared up front and everything a real radio would do
//! (advertising, notifying, dropping the link) is triggered explicitly, which
//! makes it possible to test applications and the session itself without any
//! Bluetooth hardware.

pub mod session;
pub use session::{FakeCharacteristic, FakePeripheral, FakeService, FakeSession};
