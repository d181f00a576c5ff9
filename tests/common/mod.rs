#![allow(dead_code)]

use std::cell::RefCell;

use ndarray::{Array3, Array5};
use pyke_rollout::{AudioLatent, KvCache, Latent, ModelInput, ModelOutput, Timesteps, WorldModel, WorldModelConfig};

pub fn test_config() -> WorldModelConfig {
	WorldModelConfig {
		layers: 2,
		model_width: 4,
		tokens_per_frame: 10,
		latent_channels: 2,
		latent_height: 3,
		latent_width: 3,
		audio_channels: 2,
		mouse_axes: 2,
		buttons: 11
	}
}

/// What the stub model observed during one forward pass.
pub struct CallRecord {
	pub uniform_timestep: Option<u32>,
	pub requires_grad: bool,
	pub had_video: bool,
	pub had_keyframe: bool,
	pub recording: Option<bool>,
	pub frame_slots: usize
}

/// A deterministic world model stub: echoes its video input as the denoised
/// estimate (zeros when generating from cache alone), appends one frame's
/// worth of tokens per slot to every cache layer, and records what it saw.
pub struct RecordingModel {
	config: WorldModelConfig,
	pub calls: RefCell<Vec<CallRecord>>
}

impl RecordingModel {
	pub fn new(config: WorldModelConfig) -> Self {
		Self { config, calls: RefCell::new(Vec::new()) }
	}
}

impl WorldModel for RecordingModel {
	fn forward(&self, input: ModelInput<'_>, cache: Option<&mut KvCache>) -> anyhow::Result<ModelOutput> {
		let batch_size = input.conditioning.mouse.shape()[0];
		let frame_slots = input.video.map_or(1, |v| v.view().shape()[1]);

		let recording = match cache {
			Some(cache) => {
				let recording = cache.is_recording();
				let tokens = Array3::<f32>::zeros((batch_size, frame_slots * self.config.tokens_per_frame, self.config.model_width));
				for layer in 0..self.config.layers {
					cache.push(layer, tokens.view(), tokens.view())?;
				}
				Some(recording)
			}
			None => None
		};

		let requires_grad = input.video.map_or(false, |v| v.requires_grad());
		self.calls.borrow_mut().push(CallRecord {
			uniform_timestep: match input.timesteps {
				Timesteps::Uniform(t) => Some(t),
				Timesteps::PerSlot { .. } => None
			},
			requires_grad,
			had_video: input.video.is_some(),
			had_keyframe: input.keyframe.is_some(),
			recording,
			frame_slots
		});

		let video = match input.video {
			Some(video) => video.data().clone(),
			None => Array5::zeros((batch_size, 1, self.config.latent_channels, self.config.latent_height, self.config.latent_width))
		};
		Ok(ModelOutput {
			video: Latent::from_parts(video, requires_grad),
			audio: Some(AudioLatent::from_parts(Array3::zeros((batch_size, frame_slots, self.config.audio_channels)), requires_grad))
		})
	}
}
