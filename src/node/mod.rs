//! Node-level glue

pub mod events;

pub use events::{ChannelEvent, ChannelEventDispatcher};
