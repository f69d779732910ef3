//! uescope: a read-only live-memory object-graph inspector for processes
//! embedding an Unreal Engine style reflection runtime.
//!
//! Given a target pid, the crate locates the string-interning pool and
//! the global object registry, walks them into immutable snapshots, and
//! answers browsing, search and live property-resolution queries against
//! the running process. The [`Inspector`] facade is the boundary a UI
//! talks to; everything it returns is JSON-serializable and progress is
//! published on a broadcast channel.

pub mod address;
pub mod discovery;
pub mod error;
pub mod events;
pub mod layout;
pub mod model;
pub mod names;
pub mod objects;
pub mod pe;
pub mod process;
pub mod query;
pub mod signature;
pub mod storage;
pub mod wire;

mod inspector;

pub use self::address::Address;
pub use self::error::{Error, Result};
pub use self::events::{CancelToken, Event};
pub use self::inspector::Inspector;
pub use self::layout::{LayoutProfile, SelectedLayout, UeVersion};
pub use self::process::{MemorySource, Process};

#[cfg(test)]
mod testutil;
