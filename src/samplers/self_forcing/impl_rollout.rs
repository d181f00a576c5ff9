use ndarray::{concatenate, Array2, Array5, Axis};
use ndarray_rand::{rand_distr::StandardNormal, RandomExt};

use super::{HistoryFrame, RolloutMode, RolloutOutput, SelfForcingSampler};
use crate::model::{AudioLatent, ConditioningFrame, Latent, ModelInput, Timesteps, WorldModel};
use crate::samplers::Conditioning;
use crate::RolloutError;

/// One frame's finished denoising trajectory.
struct FrameTrajectory {
	video: Latent,
	audio: AudioLatent,
	video_score: Latent,
	audio_score: AudioLatent,
	selected_timestep: u32
}

impl<M: WorldModel> SelfForcingSampler<M> {
	/// Generates `num_frames` frames autoregressively.
	///
	/// The session cache is reset at the start of every rollout. If a history
	/// primer is supplied it is replayed once with recording enabled and
	/// timestep fixed at 0, without gradient tracking, to warm the cache.
	///
	/// In [`RolloutMode::Training`] the returned tensors are the scored
	/// outputs at each frame's selected timestep; in
	/// [`RolloutMode::Inference`] they are the final detached clean outputs.
	/// Frame order matches generation order.
	///
	/// # Errors
	/// [`RolloutError::ShapeMismatch`] if the conditioning does not report
	/// exactly `num_frames` frames for the configured batch size, or if a
	/// primer frame's shape disagrees with the model geometry.
	pub fn rollout(&mut self, conditioning: &Conditioning, primer: Option<&[HistoryFrame]>) -> anyhow::Result<RolloutOutput> {
		let batch_size = self.options.batch_size;
		let num_frames = self.options.num_frames;
		if conditioning.num_frames()? != num_frames || conditioning.batch_size()? != batch_size {
			return Err(RolloutError::shape_mismatch(
				format!("conditioning with (batch, frames) = ({batch_size}, {num_frames})"),
				format!("({}, {})", conditioning.batch_size()?, conditioning.num_frames()?)
			)
			.into());
		}

		self.cache.reset(batch_size);
		if let Some(primer) = primer {
			self.warm_cache(primer)?;
		}

		let mut video_scores = Vec::with_capacity(num_frames);
		let mut audio_scores = Vec::with_capacity(num_frames);
		let mut clean_video = Vec::with_capacity(num_frames);
		let mut clean_audio = Vec::with_capacity(num_frames);
		let mut selected = Vec::with_capacity(num_frames);

		for i in 0..num_frames {
			let trajectory = self.denoise_frame(i, conditioning)?;
			selected.push(trajectory.selected_timestep);
			video_scores.push(trajectory.video_score);
			audio_scores.push(trajectory.audio_score);
			clean_video.push(trajectory.video);
			clean_audio.push(trajectory.audio);
		}

		// every batch element shares the frame's drawn timestep
		let selected_timesteps = Array2::from_shape_fn((batch_size, num_frames), |(_, i)| selected[i]);

		let output = match self.options.mode {
			RolloutMode::Training => RolloutOutput::Training {
				video_scores: concatenate(Axis(1), &video_scores.iter().map(|l| l.view()).collect::<Vec<_>>())?,
				audio_scores: concatenate(Axis(1), &audio_scores.iter().map(|l| l.view()).collect::<Vec<_>>())?,
				selected_timesteps
			},
			RolloutMode::Inference => RolloutOutput::Inference {
				video: concatenate(Axis(1), &clean_video.iter().map(|l| l.view()).collect::<Vec<_>>())?,
				audio: concatenate(Axis(1), &clean_audio.iter().map(|l| l.view()).collect::<Vec<_>>())?,
				selected_timesteps
			}
		};
		Ok(output)
	}

	/// Replays pre-generated history through the model to fill the rolling
	/// cache, without tracking gradients.
	fn warm_cache(&mut self, primer: &[HistoryFrame]) -> anyhow::Result<()> {
		let expected = self.config.latent_shape(self.options.batch_size, 1);
		self.cache.enable_updates();
		for frame in primer {
			if frame.video.dim() != expected {
				self.cache.disable_updates();
				return Err(RolloutError::shape_mismatch(format!("{expected:?}"), format!("{:?}", frame.video.shape())).into());
			}
			let video = Latent::new(frame.video.clone());
			self.model.forward(
				ModelInput {
					video: Some(&video),
					audio: None,
					keyframe: None,
					timesteps: Timesteps::Uniform(0),
					conditioning: ConditioningFrame {
						mouse: frame.mouse.view(),
						buttons: frame.buttons.view(),
						audio: Some(frame.audio.view())
					}
				},
				Some(&mut self.cache)
			)?;
			self.cache.enforce_capacity()?;
		}
		self.cache.disable_updates();
		Ok(())
	}

	/// Runs one frame's denoising trajectory through the step schedule.
	fn denoise_frame(&mut self, frame_idx: usize, conditioning: &Conditioning) -> anyhow::Result<FrameTrajectory> {
		let selected_timestep = self.options.schedule.draw_selected(&mut self.rng);
		let (b, _, c, h, w) = self.config.latent_shape(self.options.batch_size, 1);

		// the first denoising call always starts from pure noise
		let mut x_t = Latent::new(Array5::random_using((b, 1, c, h, w), StandardNormal, &mut self.rng));
		let mut audio_t: Option<AudioLatent> = None;

		let mut score: Option<(Latent, AudioLatent)> = None;
		let mut last: Option<(Latent, AudioLatent)> = None;

		let steps = self.options.schedule.clone();
		for (step_idx, &t) in steps.steps().iter().enumerate() {
			// x_t starts each step as a fresh computation root; gradient
			// tracking is re-attached only on the frame's scored step
			let keep_grad = self.horizon.keep_grad(frame_idx, t, selected_timestep);
			x_t.detach();
			x_t.set_requires_grad(keep_grad);

			self.cache.enable_updates();
			let output = self.model.forward(
				ModelInput {
					video: Some(&x_t),
					audio: audio_t.as_ref(),
					keyframe: None,
					timesteps: Timesteps::Uniform(t),
					conditioning: conditioning.frame(frame_idx)
				},
				Some(&mut self.cache)
			)?;
			self.cache.disable_updates();
			self.cache.enforce_capacity()?;

			let mut x_0 = output.video;
			let mut audio_0 = output
				.audio
				.ok_or_else(|| RolloutError::shape_mismatch("model output with an audio head", "video only"))?;

			if !self.horizon.grad_frame(frame_idx) {
				x_0.detach();
				audio_0.detach();
			}

			if t == selected_timestep {
				score = Some((x_0.clone(), audio_0.clone()));
			}

			if t == 0 {
				// terminal: clean outputs are never backpropagated through
				last = Some((x_0.detached(), audio_0.detached()));
				break;
			}

			let next_t = steps.steps()[step_idx + 1];
			let (noisy_video, _) = self.options.noise_schedule.q_sample(&x_0.view(), next_t, &mut self.rng)?;
			let (noisy_audio, _) = self.options.noise_schedule.q_sample(&audio_0.view(), next_t, &mut self.rng)?;
			x_t = Latent::from_parts(noisy_video, x_0.requires_grad());
			audio_t = Some(AudioLatent::from_parts(noisy_audio, audio_0.requires_grad()));
		}

		let (video, audio) = last.expect("schedule ends at the terminal step");
		let (video_score, audio_score) = score.expect("selected timestep is always visited");

		Ok(FrameTrajectory {
			video,
			audio,
			video_score,
			audio_score,
			selected_timestep
		})
	}
}
