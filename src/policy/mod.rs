pub mod access;
pub mod safety;

pub use access::{AccessControlPolicy, DoorIntent};
pub use safety::{AlarmIntent, LedIntent, SafetyPolicy};
