pub mod service;
pub mod value;

pub use service::{is_server_newer, DeviceStateService};
