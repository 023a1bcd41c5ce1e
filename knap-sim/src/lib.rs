//! Simulated buttons and an in-process radio for exercising `knap-core`
//! without Bluetooth hardware.

pub mod config;
pub mod device;
pub mod link;

pub use device::SimButton;
pub use link::LoopbackTransport;
