//! # A360 Common Library
//!
//! Shared code for the A360 aging-timeline tools including:
//! - Error types
//! - Subject and age-label identifiers
//! - Watcher event types (WatcherEvent) and EventBus
//! - Configuration loading

pub mod config;
pub mod error;
pub mod events;
pub mod reconnect;
pub mod subject;

pub use error::{Error, Result};
pub use events::{ArtifactStage, EventBus, SlotStatus, WatcherEvent};
pub use subject::{AgeLabel, SubjectId, SubjectRecord, TIMELINE_AGES};
