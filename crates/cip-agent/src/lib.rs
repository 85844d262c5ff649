mod controller;
mod investigator;
mod planner;
mod probes;
mod prompts;
mod proposer;

pub use controller::{ControllerResult, narrow_test_cmd, run_controller};
pub use investigator::{probe_candidates, recall_candidates};
pub use planner::{landmarks_to_steps, plan_landmarks, plan_steps, synthesize};
pub use probes::run_investigation;
pub use proposer::propose;
