pub mod orchestrator;

pub use orchestrator::{MotionListener, MotionOrchestrator};
