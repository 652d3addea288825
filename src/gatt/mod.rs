//! Radio delivery
//!
//! The audio GATT service (control, info and subscription state), the
//! link seam, and the scheduler that paces payload onto the link.

pub mod link;
pub mod scheduler;
pub mod service;

pub use link::{Clock, LinkEvent, ManualClock, RadioLink, SimulatedLink, SystemClock};
pub use scheduler::{
    DeliveryEnd, DeliveryOutcome, DeliveryPolicy, DeliveryReport, DeliveryScheduler, DeliverySession, DeliveryStats,
};
pub use service::{AudioService, Control, PlaybackState, ServiceEndpoint};
