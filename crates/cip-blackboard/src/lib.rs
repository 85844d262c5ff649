mod fusion;
mod scheduler;
mod store;

pub use fusion::fuse;
pub use scheduler::{Pcb, ProbeScheduler};
pub use store::{Blackboard, suspects_from_candidates};
