//! BeeQuiet LAN discovery (component 4.5).

mod beequiet;

pub use beequiet::{BeeQuietDiscovery, DiscoveredPeer, FrameType, WIRE_MAGIC};
