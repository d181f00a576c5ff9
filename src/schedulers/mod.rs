//! The noise and step schedules that drive a frame's denoising trajectory.
//!
//! * The [`FlowMatchSchedule`] table maps integer timesteps to noise levels —
//! adding noise at a given level (`q_sample`) re-seeds a clean estimate for
//! the next denoising step, and the table's `alpha`/`sigma` pair defines how
//! signal and noise mix.
//! * The [`StepSchedule`] is the descending list of timesteps one frame is
//! iteratively refined through, ending at the terminal step 0.

mod flow_match;
mod step_schedule;

pub use self::flow_match::{zlerp, FlowMatchSchedule};
pub use self::step_schedule::StepSchedule;
