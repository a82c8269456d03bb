//! Writing legacy (`docker save` / `docker load`) image archives.

pub mod assemble;
pub mod layout;
pub mod verify;

pub use assemble::{assemble, remove_work_dir};
pub use layout::LayerRecord;
pub use verify::{ArchiveSummary, verify_archive};
