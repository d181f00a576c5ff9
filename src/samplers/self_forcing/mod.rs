// Copyright 2022-2023 pyke.io
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// 	http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use ndarray::{Array2, Array3, Array5};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::cache::KvCache;
use crate::model::WorldModel;
use crate::schedulers::{FlowMatchSchedule, StepSchedule};
use crate::{RolloutError, WorldModelConfig};

mod impl_rollout;

/// Whether a rollout produces distillation targets or clean frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloutMode {
	/// Collect the scored outputs at each frame's selected timestep;
	/// gradient-eligible frames keep gradient tracking on exactly that step.
	Training,
	/// Collect the final detached clean outputs; nothing tracks gradients.
	Inference
}

/// Decides, per generated frame and per step, whether gradient tracking is
/// enabled.
///
/// Only the trailing `gradient_cutoff_frames` frames of a run carry gradients
/// at all, bounding backpropagation depth through the autoregressive rollout;
/// within an eligible frame, only the step matching the frame's selected
/// timestep is scored.
#[derive(Debug, Clone, Copy)]
pub struct GradientHorizon {
	start_grad_at: usize,
	training: bool
}

impl GradientHorizon {
	/// Derives the horizon for a run of `num_frames` frames.
	///
	/// # Errors
	/// - [`RolloutError::InvariantViolation`] if `gradient_cutoff_frames >=
	///   context_frames`: a frame could then be gradient-tracked and
	///   truncated from the cache at the same time.
	/// - [`RolloutError::Config`] if `num_frames <= gradient_cutoff_frames`
	///   (degenerate horizon; every frame would carry gradients).
	pub fn new(num_frames: usize, gradient_cutoff_frames: usize, context_frames: usize, mode: RolloutMode) -> anyhow::Result<Self> {
		if gradient_cutoff_frames >= context_frames {
			return Err(RolloutError::InvariantViolation(format!(
				"gradient_cutoff_frames ({gradient_cutoff_frames}) must be < context_frames ({context_frames})"
			))
			.into());
		}
		if num_frames <= gradient_cutoff_frames {
			return Err(RolloutError::Config(format!("num_frames ({num_frames}) must be > gradient_cutoff_frames ({gradient_cutoff_frames})")).into());
		}
		Ok(Self {
			start_grad_at: num_frames - gradient_cutoff_frames,
			training: mode == RolloutMode::Training
		})
	}

	/// First frame index eligible for gradient tracking.
	pub fn start_grad_at(&self) -> usize {
		self.start_grad_at
	}

	/// Whether `frame_idx` is within the gradient horizon at all.
	pub fn grad_frame(&self, frame_idx: usize) -> bool {
		self.training && frame_idx >= self.start_grad_at
	}

	/// Whether step `t` of `frame_idx` keeps gradient tracking enabled: the
	/// frame must be within the horizon and `t` must be the frame's selected
	/// timestep.
	pub fn keep_grad(&self, frame_idx: usize, t: u32, selected_timestep: u32) -> bool {
		self.grad_frame(frame_idx) && t == selected_timestep
	}
}

/// Options for the self-forcing rollout engine.
#[derive(Debug, Clone)]
pub struct SelfForcingOptions {
	pub(crate) batch_size: usize,
	pub(crate) num_frames: usize,
	pub(crate) context_frames: usize,
	pub(crate) gradient_cutoff_frames: usize,
	pub(crate) mode: RolloutMode,
	pub(crate) schedule: StepSchedule,
	pub(crate) noise_schedule: FlowMatchSchedule,
	pub(crate) seed: Option<u64>
}

impl Default for SelfForcingOptions {
	fn default() -> Self {
		Self {
			batch_size: 1,
			num_frames: 64,
			context_frames: 48,
			gradient_cutoff_frames: 8,
			mode: RolloutMode::Inference,
			schedule: StepSchedule::default(),
			noise_schedule: FlowMatchSchedule::default(),
			seed: None
		}
	}
}

impl SelfForcingOptions {
	/// Set the batch size of the rollout.
	pub fn with_batch_size(mut self, batch_size: usize) -> Self {
		self.batch_size = batch_size;
		self
	}
	/// Set the number of frames to generate per rollout.
	pub fn with_num_frames(mut self, num_frames: usize) -> Self {
		self.num_frames = num_frames;
		self
	}
	/// Set the context window of the rolling cache, in frames.
	pub fn with_context_frames(mut self, context_frames: usize) -> Self {
		self.context_frames = context_frames;
		self
	}
	/// Set how many trailing frames of the run carry gradients. Must be
	/// strictly less than the context window.
	pub fn with_gradient_cutoff(mut self, gradient_cutoff_frames: usize) -> Self {
		self.gradient_cutoff_frames = gradient_cutoff_frames;
		self
	}
	/// Select training or inference collection; see [`RolloutMode`].
	pub fn with_mode(mut self, mode: RolloutMode) -> Self {
		self.mode = mode;
		self
	}
	/// Set the few-step denoising schedule.
	pub fn with_schedule(mut self, schedule: StepSchedule) -> Self {
		self.schedule = schedule;
		self
	}
	/// Set the noise schedule table.
	pub fn with_noise_schedule(mut self, noise_schedule: FlowMatchSchedule) -> Self {
		self.noise_schedule = noise_schedule;
		self
	}
	/// Set the seed used for noise draws and timestep selection.
	pub fn with_seed(mut self, seed: u64) -> Self {
		self.seed = Some(seed);
		self
	}
	/// Use a random seed, so that each run generates different frames.
	pub fn with_random_seed(mut self) -> Self {
		self.seed = None;
		self
	}
}

/// One frame of pre-generated history used to warm the cache before
/// generation begins. All tensors cover a single frame.
#[derive(Debug, Clone)]
pub struct HistoryFrame {
	/// Clean video latent, `(batch, 1, channels, height, width)`.
	pub video: Array5<f32>,
	/// Mouse axes, `(batch, 1, mouse_axes)`.
	pub mouse: Array3<f32>,
	/// Button states, `(batch, 1, buttons)`.
	pub buttons: Array3<f32>,
	/// User audio, `(batch, 1, audio_channels)`.
	pub audio: Array3<f32>
}

/// The result of one rollout, tagged by collection mode.
#[derive(Debug, Clone)]
pub enum RolloutOutput {
	/// Distillation targets: the outputs recorded at each frame's selected
	/// timestep.
	Training {
		/// Scored video estimates, `(batch, frames, channels, height, width)`.
		video_scores: Array5<f32>,
		/// Scored audio estimates, `(batch, frames, audio_channels)`.
		audio_scores: Array3<f32>,
		/// The selected timestep per frame, broadcast to `(batch, frames)`.
		selected_timesteps: Array2<u32>
	},
	/// Clean frames: the final detached outputs of each trajectory.
	Inference {
		/// Clean video latents, `(batch, frames, channels, height, width)`.
		video: Array5<f32>,
		/// Clean audio latents, `(batch, frames, audio_channels)`.
		audio: Array3<f32>,
		/// The selected timestep per frame, broadcast to `(batch, frames)`.
		selected_timesteps: Array2<u32>
	}
}

impl RolloutOutput {
	/// The selected timestep per frame, broadcast to `(batch, frames)`.
	pub fn selected_timesteps(&self) -> &Array2<u32> {
		match self {
			Self::Training { selected_timesteps, .. } | Self::Inference { selected_timesteps, .. } => selected_timesteps
		}
	}
}

/// The autoregressive rollout engine: drives the per-frame denoising
/// trajectory across a whole run while maintaining the rolling cache and the
/// gradient horizon.
///
/// ```ignore
/// use pyke_rollout::{RolloutMode, SelfForcingOptions, SelfForcingSampler, WorldModelConfig};
///
/// let config = WorldModelConfig::from_file("./world-model/rollout.json")?;
/// let mut sampler = SelfForcingSampler::new(
/// 	model,
/// 	config,
/// 	SelfForcingOptions::default().with_num_frames(64).with_mode(RolloutMode::Training)
/// )?;
/// let output = sampler.rollout(&conditioning, None)?;
/// ```
pub struct SelfForcingSampler<M> {
	pub(crate) model: M,
	pub(crate) config: WorldModelConfig,
	pub(crate) options: SelfForcingOptions,
	pub(crate) horizon: GradientHorizon,
	pub(crate) cache: KvCache,
	pub(crate) rng: StdRng
}

impl<M> std::fmt::Debug for SelfForcingSampler<M> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str("SelfForcingSampler")
	}
}

impl<M: WorldModel> SelfForcingSampler<M> {
	/// Creates a rollout engine and its session cache.
	///
	/// # Errors
	/// Fails if the config or gradient horizon is invalid, or if the step
	/// schedule starts beyond the noise schedule table's domain.
	pub fn new(model: M, config: WorldModelConfig, options: SelfForcingOptions) -> anyhow::Result<Self> {
		config.validate()?;
		if options.schedule.start() > options.noise_schedule.num_timesteps() {
			return Err(RolloutError::OutOfRange {
				timestep: options.schedule.start(),
				max: options.noise_schedule.num_timesteps()
			}
			.into());
		}
		let horizon = GradientHorizon::new(options.num_frames, options.gradient_cutoff_frames, options.context_frames, options.mode)?;

		let mut cache = KvCache::new(&config, options.context_frames);
		cache.reset(options.batch_size);

		let rng = StdRng::seed_from_u64(options.seed.unwrap_or_else(|| rand::thread_rng().gen::<u64>()));

		Ok(Self {
			model,
			config,
			options,
			horizon,
			cache,
			rng
		})
	}

	/// The engine's rolling cache, e.g. for occupancy telemetry.
	pub fn cache(&self) -> &KvCache {
		&self.cache
	}

	/// The world model this engine drives.
	pub fn model(&self) -> &M {
		&self.model
	}

	/// The derived gradient horizon.
	pub fn horizon(&self) -> &GradientHorizon {
		&self.horizon
	}
}
