use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::RolloutError;

/// Geometry of the world model a rollout session drives.
///
/// Loaded from a JSON manifest shipped alongside the model weights (see
/// [`WorldModelConfig::from_file`]), or constructed directly.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct WorldModelConfig {
	/// Number of transformer layers, i.e. the number of k/v cache entries.
	pub layers: usize,
	/// Width of a single cached token representation.
	pub model_width: usize,
	/// Number of context tokens one latent frame occupies in the cache.
	pub tokens_per_frame: usize,
	/// Channel count of the latent space.
	pub latent_channels: usize,
	/// Height of one latent frame.
	pub latent_height: usize,
	/// Width of one latent frame.
	pub latent_width: usize,
	/// Width of one denoised audio latent.
	pub audio_channels: usize,
	/// Number of mouse axes in the conditioning vector.
	pub mouse_axes: usize,
	/// Number of buttons in the conditioning vector.
	pub buttons: usize
}

impl WorldModelConfig {
	/// Loads a config from a JSON manifest at `path`.
	pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
		let config: WorldModelConfig = serde_json::from_str(&fs::read_to_string(path)?)?;
		config.validate()?;
		Ok(config)
	}

	/// Checks that every dimension is nonzero.
	pub fn validate(&self) -> anyhow::Result<()> {
		for (name, value) in [
			("layers", self.layers),
			("model-width", self.model_width),
			("tokens-per-frame", self.tokens_per_frame),
			("latent-channels", self.latent_channels),
			("latent-height", self.latent_height),
			("latent-width", self.latent_width),
			("audio-channels", self.audio_channels),
			("mouse-axes", self.mouse_axes),
			("buttons", self.buttons)
		] {
			if value == 0 {
				return Err(RolloutError::Config(format!("`{name}` must be nonzero")).into());
			}
		}
		Ok(())
	}

	/// Shape of a latent frame sequence for the given batch and frame count.
	pub fn latent_shape(&self, batch_size: usize, frames: usize) -> (usize, usize, usize, usize, usize) {
		(batch_size, frames, self.latent_channels, self.latent_height, self.latent_width)
	}
}
