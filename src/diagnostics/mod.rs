// Delivery diagnostics for capture sessions.

pub mod stats;

pub use stats::{DeliverySnapshot, DeliveryStats};
