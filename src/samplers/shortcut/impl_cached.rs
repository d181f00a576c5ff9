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

use ndarray::{concatenate, s, Array1, Array5, ArrayView3, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{HistoryOptions, ShortcutCallback, ShortcutOptions, ShortcutOutput, CONTEXT_BLEND, CONTEXT_STEP_BUDGET};
use crate::cache::KvCache;
use crate::model::{ConditioningFrame, Latent, ModelInput, Timesteps, WorldModel};
use crate::schedulers::zlerp;
use crate::util::actions::extend_to_length;
use crate::{RolloutError, WorldModelConfig};

/// Interactive sampler with a persistent cache seeded once from a history of
/// real or pre-encoded frames.
///
/// Each requested frame is a mandatory two-phase call: the new frame is
/// generated in one collapsed step against the frozen cache, then the oldest
/// cached frame is dropped and the new frame — re-noised to
/// [`CONTEXT_BLEND`] — is replayed through the model to fold it into the
/// cache. Skipping the second phase would desynchronize the cache from the
/// emitted frame sequence.
pub struct CachedShortcutSampler<M> {
	model: M,
	config: WorldModelConfig,
	options: ShortcutOptions,
	cache: KvCache,
	cache_built: bool,
	history: Array5<f32>,
	keyframe: Array5<f32>,
	rng: StdRng
}

impl<M> std::fmt::Debug for CachedShortcutSampler<M> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str("CachedShortcutSampler")
	}
}

impl<M: WorldModel> CachedShortcutSampler<M> {
	/// Creates a sampler, resolving the initial history from `history`.
	///
	/// The keyframe defaults to the first history frame when
	/// [`ShortcutOptions::with_keyframe`] is unset.
	///
	/// # Errors
	/// Fails with [`RolloutError::Config`] if no history source is supplied
	/// or a raw-frame source lacks an encoder, and with
	/// [`RolloutError::ShapeMismatch`] if the resolved history does not match
	/// `(1, window_length, channels, height, width)`.
	pub fn new(model: M, config: WorldModelConfig, mut options: ShortcutOptions, history: HistoryOptions) -> anyhow::Result<Self> {
		config.validate()?;
		if options.window_length == 0 {
			return Err(RolloutError::Config("window_length must be nonzero".to_string()).into());
		}

		let history = history.resolve(&config, options.window_length)?;
		let keyframe = match options.keyframe.take() {
			Some(keyframe) => {
				let expected = config.latent_shape(1, 1);
				if keyframe.dim() != expected {
					return Err(RolloutError::shape_mismatch(format!("{expected:?}"), format!("{:?}", keyframe.shape())).into());
				}
				keyframe
			}
			None => history.slice(s![.., 0..1, .., .., ..]).to_owned()
		};

		let cache = KvCache::new(&config, options.window_length);
		let rng = StdRng::seed_from_u64(options.seed.unwrap_or_else(|| rand::thread_rng().gen::<u64>()));

		Ok(Self {
			model,
			config,
			options,
			cache,
			cache_built: false,
			history,
			keyframe,
			rng
		})
	}

	/// Seeds the cache by replaying the noised history through the model with
	/// recording enabled. Must run once before
	/// [`generate_frames`](CachedShortcutSampler::generate_frames).
	///
	/// `mouse` and `buttons` are the actions of the history window,
	/// `(1, window_length, dim)`.
	///
	/// # Errors
	/// Seeding an already-seeded cache is a
	/// [`RolloutError::InvariantViolation`]; call
	/// [`reset_session`](CachedShortcutSampler::reset_session) first to
	/// re-seed.
	pub fn init_cache(&mut self, mouse: ArrayView3<'_, f32>, buttons: ArrayView3<'_, f32>) -> anyhow::Result<()> {
		if self.cache_built {
			return Err(RolloutError::InvariantViolation("cache already seeded".to_string()).into());
		}
		let window_length = self.options.window_length;
		for (name, shape) in [("mouse", mouse.shape()), ("buttons", buttons.shape())] {
			if shape[0] != 1 || shape[1] != window_length {
				return Err(RolloutError::shape_mismatch(format!("{name} with (batch, frames) = (1, {window_length})"), format!("{shape:?}")).into());
			}
		}

		self.cache.reset(1);
		self.cache.enable_updates();
		let noisy_history = Latent::new(zlerp(self.history.view(), CONTEXT_BLEND, &mut self.rng));
		let keyframe = Latent::new(self.keyframe.clone());
		let (mouse, buttons) = (mouse.view(), buttons.view());
		self.model.forward(
			ModelInput {
				video: Some(&noisy_history),
				audio: None,
				keyframe: Some(&keyframe),
				timesteps: Timesteps::PerSlot {
					noise_levels: Array1::from_elem(window_length, CONTEXT_BLEND),
					step_budgets: Array1::from_elem(window_length, CONTEXT_STEP_BUDGET)
				},
				conditioning: ConditioningFrame { mouse, buttons, audio: None }
			},
			Some(&mut self.cache)
		)?;
		self.cache.disable_updates();
		self.cache.enforce_capacity()?;
		self.cache_built = true;
		Ok(())
	}

	/// Generates frames one at a time, re-seeding the cache after each.
	///
	/// `mouse` and `buttons` must cover at least the history window; they are
	/// extended to `window_length + num_frames` rows by replaying shuffled
	/// history actions if not long enough.
	///
	/// # Errors
	/// Calling this before [`init_cache`](CachedShortcutSampler::init_cache)
	/// is a [`RolloutError::InvariantViolation`].
	pub fn generate_frames(&mut self, mouse: ArrayView3<'_, f32>, buttons: ArrayView3<'_, f32>) -> anyhow::Result<ShortcutOutput> {
		if !self.cache_built {
			return Err(RolloutError::InvariantViolation("cache not seeded; call init_cache first".to_string()).into());
		}
		let window_length = self.options.window_length;
		let num_frames = self.options.num_frames;
		let (mouse, buttons) = extend_to_length(mouse, buttons, window_length + num_frames, &mut self.rng)?;

		let mut generated: Vec<Array5<f32>> = Vec::with_capacity(num_frames);
		for i in 0..num_frames {
			let frame_mouse = mouse.slice(s![.., window_length + i..window_length + i + 1, ..]);
			let frame_buttons = buttons.slice(s![.., window_length + i..window_length + i + 1, ..]);
			let frame = self.next_frame(frame_mouse, frame_buttons)?;

			let keep_going = match &self.options.callback {
				Some(ShortcutCallback::Progress { frequency, cb }) if i % frequency == 0 => cb(i),
				Some(ShortcutCallback::Frames { frequency, cb }) if i % frequency == 0 => cb(i, frame.view()),
				_ => true
			};
			generated.push(frame);
			if !keep_going {
				break;
			}
		}

		let n_generated = generated.len();
		let generated = concatenate(Axis(1), &generated.iter().map(|f| f.view()).collect::<Vec<_>>())?;
		let frames = concatenate![Axis(1), self.history.view(), generated.view()];

		super::assemble_output(&self.options, frames, mouse, buttons, n_generated)
	}

	/// One two-phase frame step: collapsed one-step generation against the
	/// frozen cache, then drop-oldest + noisy replay to fold the new frame in.
	fn next_frame(&mut self, mouse: ArrayView3<'_, f32>, buttons: ArrayView3<'_, f32>) -> anyhow::Result<Array5<f32>> {
		let keyframe = Latent::new(self.keyframe.clone());
		let (mouse, buttons) = (mouse.view(), buttons.view());

		// 1. generate the next frame from cache context alone
		self.cache.disable_updates();
		let output = self.model.forward(
			ModelInput {
				video: None,
				audio: None,
				keyframe: Some(&keyframe),
				timesteps: Timesteps::PerSlot {
					noise_levels: Array1::from_elem(1, 1.0),
					step_budgets: Array1::from_elem(1, 1.0)
				},
				conditioning: ConditioningFrame { mouse, buttons, audio: None }
			},
			Some(&mut self.cache)
		)?;
		let frame = output.video.into_data();
		let expected = self.config.latent_shape(1, 1);
		if frame.dim() != expected {
			return Err(RolloutError::shape_mismatch(format!("{expected:?}"), format!("{:?}", frame.shape())).into());
		}

		// 2. repopulate the cache with the re-noised frame
		self.cache.enable_updates();
		self.cache.truncate(1);
		let noisy_frame = Latent::new(zlerp(frame.view(), CONTEXT_BLEND, &mut self.rng));
		self.model.forward(
			ModelInput {
				video: Some(&noisy_frame),
				audio: None,
				keyframe: Some(&keyframe),
				timesteps: Timesteps::PerSlot {
					noise_levels: Array1::from_elem(1, CONTEXT_BLEND),
					step_budgets: Array1::from_elem(1, CONTEXT_STEP_BUDGET)
				},
				conditioning: ConditioningFrame { mouse, buttons, audio: None }
			},
			Some(&mut self.cache)
		)?;
		self.cache.disable_updates();
		self.cache.enforce_capacity()?;

		Ok(frame)
	}

	/// Clears the cache and forgets the seed, so
	/// [`init_cache`](CachedShortcutSampler::init_cache) can run again for a
	/// fresh session.
	pub fn reset_session(&mut self) {
		self.cache.reset(1);
		self.cache_built = false;
	}

	/// Whether the cache has been seeded.
	pub fn is_cache_built(&self) -> bool {
		self.cache_built
	}

	/// The sampler's rolling cache, e.g. for occupancy telemetry.
	pub fn cache(&self) -> &KvCache {
		&self.cache
	}

	/// The world model this sampler drives.
	pub fn model(&self) -> &M {
		&self.model
	}
}
