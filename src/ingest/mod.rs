//! Ingestion of externally-produced event files.

mod attrs;
mod listener;
mod parser;

pub use attrs::{DirAttributes, FileAttributes, LISTENED_MASK_ATTR};
pub use listener::OsEventListener;
pub use parser::{parse_event_file, parse_event_line};
