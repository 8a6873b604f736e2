pub mod column;
pub mod header;
pub mod lifecycle;
pub mod partition;

pub use self::column::{ColType, Column, PartCtx, TypedArray};
pub use self::header::{HeaderInfo, MeshDim, PartState};
pub use self::lifecycle::wait_for_background_tasks;
pub use self::partition::Partition;
