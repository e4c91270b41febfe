//! Domain model module declarations.

pub mod checkpoint;
pub mod lock;
pub mod recovery;
pub mod resume;
pub mod signals;
pub mod worker;
