use ndarray::{concatenate, s, Array1, Array5, ArrayView3, ArrayView5, Axis};
use ndarray_rand::{rand_distr::StandardNormal, RandomExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{ShortcutCallback, ShortcutOptions, ShortcutOutput, CONTEXT_BLEND, CONTEXT_STEP_BUDGET};
use crate::model::{ConditioningFrame, Latent, ModelInput, Timesteps, WorldModel};
use crate::schedulers::zlerp;
use crate::util::actions::extend_to_length;
use crate::{RolloutError, WorldModelConfig};

/// Cache-free sliding-window sampler.
///
/// Each new frame re-runs the model over the entire trailing window: all but
/// the last slot are blended to [`CONTEXT_BLEND`] with a 4-step budget, the
/// last slot starts as pure noise with a 1-step budget, and the model's last
/// output slot becomes the new frame. The window then slides forward by
/// concatenation.
pub struct WindowShortcutSampler<M> {
	model: M,
	config: WorldModelConfig,
	options: ShortcutOptions,
	history: Array5<f32>,
	window: Array5<f32>,
	keyframe: Option<Array5<f32>>,
	rng: StdRng
}

impl<M> std::fmt::Debug for WindowShortcutSampler<M> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str("WindowShortcutSampler")
	}
}

impl<M: WorldModel> WindowShortcutSampler<M> {
	/// Creates a sampler over `history`, shaped
	/// `(batch, frames, channels, height, width)` with at least
	/// `window_length` frames; the trailing window is used.
	pub fn new(model: M, config: WorldModelConfig, mut options: ShortcutOptions, history: Array5<f32>) -> anyhow::Result<Self> {
		config.validate()?;
		if options.window_length < 2 {
			return Err(RolloutError::Config("window_length must be at least 2 (context plus the generated slot)".to_string()).into());
		}
		let shape = history.shape();
		if shape[1] < options.window_length || shape[2] != config.latent_channels || shape[3] != config.latent_height || shape[4] != config.latent_width {
			return Err(RolloutError::shape_mismatch(
				format!(
					"(_, >={}, {}, {}, {})",
					options.window_length, config.latent_channels, config.latent_height, config.latent_width
				),
				format!("{shape:?}")
			)
			.into());
		}

		let window = history.slice(s![.., shape[1] - options.window_length.., .., .., ..]).to_owned();
		let keyframe = options.keyframe.take();
		let rng = StdRng::seed_from_u64(options.seed.unwrap_or_else(|| rand::thread_rng().gen::<u64>()));

		Ok(Self {
			model,
			config,
			options,
			history,
			window,
			keyframe,
			rng
		})
	}

	/// Generates frames by sliding the window forward one frame per model
	/// call. Actions are extended to `window_length + num_frames` rows by
	/// replaying shuffled history actions if not long enough.
	pub fn generate_frames(&mut self, mouse: ArrayView3<'_, f32>, buttons: ArrayView3<'_, f32>) -> anyhow::Result<ShortcutOutput> {
		let window_length = self.options.window_length;
		let num_frames = self.options.num_frames;
		let (mouse, buttons) = extend_to_length(mouse, buttons, window_length + num_frames, &mut self.rng)?;

		let mut generated: Vec<Array5<f32>> = Vec::with_capacity(num_frames);
		for i in 0..num_frames {
			let frame_mouse = mouse.slice(s![.., i..i + window_length, ..]);
			let frame_buttons = buttons.slice(s![.., i..i + window_length, ..]);
			let frame = self.next_frame(frame_mouse, frame_buttons)?;

			let keep_going = match &self.options.callback {
				Some(ShortcutCallback::Progress { frequency, cb }) if i % frequency == 0 => cb(i),
				Some(ShortcutCallback::Frames { frequency, cb }) if i % frequency == 0 => cb(i, frame.view()),
				_ => true
			};
			self.window = concatenate![Axis(1), self.window.view(), frame.view()];
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

	/// One sliding-window generation step.
	fn next_frame(&mut self, mouse: ArrayView3<'_, f32>, buttons: ArrayView3<'_, f32>) -> anyhow::Result<Array5<f32>> {
		let window_length = self.options.window_length;
		let trailing = self.window.shape()[1] - window_length;
		let mut x = self.window.slice(s![.., trailing.., .., .., ..]).to_owned();
		let (batch_size, _, channels, height, width) = x.dim();

		// context slots at the blend level, generated slot as pure noise
		let context = zlerp(x.slice(s![.., ..window_length - 1, .., .., ..]), CONTEXT_BLEND, &mut self.rng);
		x.slice_mut(s![.., ..window_length - 1, .., .., ..]).assign(&context);
		let noise = Array5::<f32>::random_using((batch_size, 1, channels, height, width), StandardNormal, &mut self.rng);
		x.slice_mut(s![.., window_length - 1.., .., .., ..]).assign(&noise);

		let noise_levels = Array1::from_shape_fn(window_length, |slot| if slot < window_length - 1 { CONTEXT_BLEND } else { 1.0 });
		let step_budgets = Array1::from_shape_fn(window_length, |slot| if slot < window_length - 1 { CONTEXT_STEP_BUDGET } else { 1.0 });

		let latents = Latent::new(x);
		let keyframe = self.keyframe.as_ref().map(|k| Latent::new(k.clone()));
		let (mouse, buttons) = (mouse.view(), buttons.view());
		let output = self.model.forward(
			ModelInput {
				video: Some(&latents),
				audio: None,
				keyframe: keyframe.as_ref(),
				timesteps: Timesteps::PerSlot { noise_levels, step_budgets },
				conditioning: ConditioningFrame { mouse, buttons, audio: None }
			},
			None
		)?;

		let prediction = output.video.into_data();
		if prediction.shape()[1] != window_length {
			return Err(RolloutError::shape_mismatch(format!("prediction with {window_length} frame slots"), format!("{:?}", prediction.shape())).into());
		}
		Ok(prediction.slice(s![.., window_length - 1.., .., .., ..]).to_owned())
	}

	/// The current sliding window, most recent frame last.
	pub fn window(&self) -> ArrayView5<'_, f32> {
		self.window.view()
	}

	/// The world model this sampler drives.
	pub fn model(&self) -> &M {
		&self.model
	}
}
