//! Record streaming toolkit: an ordered concurrent pipeline, bounded memory sort and cluster
//! buffers, and a self expiring cache of output writers. The [forwarder] composes the three.

pub use crate::error::{Error, Result};

mod error;

pub mod config;
pub mod forwarder;
pub mod message;
pub mod partition;
pub mod pipeline;
pub mod sorter;
pub mod writercache;
