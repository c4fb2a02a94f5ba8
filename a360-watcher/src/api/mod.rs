//! HTTP surface: health, live event stream and slot-status queries

mod health;
mod sse;
mod subjects;

pub use health::health;
pub use sse::event_stream;
pub use subjects::{export_subject, get_subject, list_subjects};
