//! Client side of the usbmuxd wire protocol: frame layer, plist message
//! shapes, and the two operations the daemon needs (event subscription and
//! per-tunnel device connects).

pub mod client;
pub mod frame;
pub mod message;

pub use client::{MuxClient, MuxSubscription};
pub use message::{DeviceProperties, MuxEvent, MuxReply};
