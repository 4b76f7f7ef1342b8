//! Background Tasks Module
//!
//! Contains background tasks that run periodically while the cache is in
//! use.
//!
//! # Tasks
//! - Eviction: forces the global storage-budget pass at configured intervals

mod gc;

pub use gc::spawn_gc_task;
