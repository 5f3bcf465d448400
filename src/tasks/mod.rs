//! Task queues: data model, text codec, pure queue operations and the
//! file-backed store.

pub mod codec;
pub mod model;
pub mod queue;
pub mod store;

pub use model::{Metadata, Priority, Task, TaskScope, TaskStatus};
pub use store::TaskStore;
