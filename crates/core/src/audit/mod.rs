//! Append-only audit trail of pipeline and job lifecycle events.

mod events;
mod handle;
mod sqlite;
mod store;
mod writer;

pub use events::*;
pub use handle::*;
pub use sqlite::*;
pub use store::*;
pub use writer::*;
