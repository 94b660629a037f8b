//! Bridge routing and locking tests over in-process store doubles.

mod helpers;
mod locking;
mod registry;
