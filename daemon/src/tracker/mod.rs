mod engine;
mod supervisor;

pub use engine::*;
pub use supervisor::{FlowSupervisor, StageTimeout};
