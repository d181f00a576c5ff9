use rand::Rng;

use crate::RolloutError;

/// The few-step denoising schedule one frame's trajectory walks through.
///
/// Timesteps are strictly descending and always end at the terminal step 0
/// ("fully denoised") — a schedule that omits 0 is rejected at construction,
/// so the trajectory loop can never fall through without reaching a terminal
/// state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepSchedule {
	steps: Vec<u32>
}

impl Default for StepSchedule {
	/// The 4-step distillation schedule, `[1000, 750, 500, 250, 0]`.
	fn default() -> Self {
		Self::new(vec![1000, 750, 500, 250, 0]).unwrap()
	}
}

impl StepSchedule {
	/// Creates a schedule from a descending list of timesteps.
	///
	/// # Errors
	/// [`RolloutError::Config`] if the list has fewer than two entries, is
	/// not strictly descending, or does not end at 0.
	pub fn new(steps: Vec<u32>) -> anyhow::Result<Self> {
		if steps.len() < 2 {
			return Err(RolloutError::Config("schedule needs at least one non-terminal step and the terminal step 0".to_string()).into());
		}
		if steps.windows(2).any(|w| w[0] <= w[1]) {
			return Err(RolloutError::Config(format!("schedule {steps:?} must be strictly descending")).into());
		}
		if *steps.last().unwrap() != 0 {
			return Err(RolloutError::Config(format!("schedule {steps:?} must end at the terminal step 0")).into());
		}
		Ok(Self { steps })
	}

	/// The timesteps, in trajectory (descending) order.
	pub fn steps(&self) -> &[u32] {
		&self.steps
	}

	/// The starting (largest) timestep; each trajectory begins from pure
	/// noise at this step.
	pub fn start(&self) -> u32 {
		self.steps[0]
	}

	/// Number of steps, terminal step included.
	pub fn len(&self) -> usize {
		self.steps.len()
	}

	/// Always `false`; schedules are non-empty by construction.
	pub fn is_empty(&self) -> bool {
		false
	}

	/// Draws one frame's selected (scored) timestep, uniformly from the
	/// non-terminal steps. The terminal step 0 is never a distillation
	/// target.
	pub fn draw_selected<R: Rng + ?Sized>(&self, rng: &mut R) -> u32 {
		let body = &self.steps[..self.steps.len() - 1];
		body[rng.gen_range(0..body.len())]
	}
}
