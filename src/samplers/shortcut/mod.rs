//! Interactive and batch samplers built on the shortcut model: the cache is
//! seeded with a 4-step-equivalent noisy history, and new frames are sampled
//! in one collapsed step.

use std::fmt::Debug;
use std::path::PathBuf;
use std::{fs, path::Path};

use image::DynamicImage;
use ndarray::{s, Array3, Array5, ArrayView5};
use tracing::warn;

use crate::model::{FrameEncoder, LatentDecoder};
use crate::util::frames::frames_to_tensor;
use crate::{RolloutError, WorldModelConfig};

mod impl_cached;
pub use self::impl_cached::CachedShortcutSampler;

cfg_if::cfg_if! {
	if #[cfg(feature = "sampler-window")] {
		mod impl_window;
		pub use self::impl_window::WindowShortcutSampler;
	}
}

/// Noise level context frames are blended to when (re-)seeding the cache.
///
/// One noisy re-seed at this level with a 4-step budget, plus a single
/// collapsed generation step at full noise, reproduces the training-time
/// distillation setup.
pub const CONTEXT_BLEND: f32 = 0.25;

pub(crate) const CONTEXT_STEP_BUDGET: f32 = 4.0;

/// Describes a function to be called as the shortcut samplers emit frames.
pub enum ShortcutCallback {
	/// A simple callback to be used for e.g. reporting progress updates.
	Progress {
		/// Describes how frequently to call this callback (3 = every 3 frames).
		frequency: usize,
		/// Function Parameters:
		/// - **`frame`** (usize): The index of the frame just generated.
		cb: Box<dyn Fn(usize) -> bool>
	},
	/// A callback to receive each generated latent frame, to be used for e.g.
	/// streaming frames to a client as they are produced.
	Frames {
		/// Describes how frequently to call this callback (3 = every 3 frames).
		frequency: usize,
		/// Function Parameters:
		/// - **`frame`** (usize): The index of the frame just generated.
		/// - **`latent`** (`ArrayView5<f32>`): The generated latent frame.
		cb: Box<dyn Fn(usize, ArrayView5<'_, f32>) -> bool>
	}
}

impl Debug for ShortcutCallback {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str("<ShortcutCallback>")
	}
}

/// Options shared by the shortcut samplers.
pub struct ShortcutOptions {
	pub(crate) window_length: usize,
	pub(crate) num_frames: usize,
	pub(crate) only_return_generated: bool,
	pub(crate) vae_scale: f32,
	pub(crate) keyframe: Option<Array5<f32>>,
	pub(crate) decoder: Option<Box<dyn LatentDecoder>>,
	pub(crate) callback: Option<ShortcutCallback>,
	pub(crate) seed: Option<u64>
}

impl Default for ShortcutOptions {
	fn default() -> Self {
		Self {
			window_length: 60,
			num_frames: 1,
			only_return_generated: false,
			vae_scale: 2.17,
			keyframe: None,
			decoder: None,
			callback: None,
			seed: None
		}
	}
}

impl ShortcutOptions {
	/// Set the number of history frames used for each generation step.
	pub fn with_window_length(mut self, window_length: usize) -> Self {
		self.window_length = window_length;
		self
	}
	/// Set the number of new frames to sample per `generate_frames` call.
	pub fn with_num_frames(mut self, num_frames: usize) -> Self {
		self.num_frames = num_frames;
		self
	}
	/// Return only the generated frames, trimming the history (and the
	/// matching action rows) from the output.
	pub fn only_return_generated(mut self, only_return_generated: bool) -> Self {
		self.only_return_generated = only_return_generated;
		self
	}
	/// Set the scale latents are multiplied by before decoding.
	pub fn with_vae_scale(mut self, vae_scale: f32) -> Self {
		self.vae_scale = vae_scale;
		self
	}
	/// Set a keyframe to condition every generation step on, shaped
	/// `(1, 1, channels, height, width)`. The cached sampler falls back to
	/// the first history frame when unset.
	pub fn with_keyframe(mut self, keyframe: Array5<f32>) -> Self {
		self.keyframe = Some(keyframe);
		self
	}
	/// Decode sampled latents to pixel frames with the given decoder.
	pub fn with_decoder(mut self, decoder: Box<dyn LatentDecoder>) -> Self {
		self.decoder = Some(decoder);
		self
	}
	/// Set the seed used for noise draws.
	pub fn with_seed(mut self, seed: u64) -> Self {
		self.seed = Some(seed);
		self
	}
	/// Use a random seed, so that each run generates different frames.
	pub fn with_random_seed(mut self) -> Self {
		self.seed = None;
		self
	}
	/// Call `callback` after every `frequency` generated frames; return
	/// `false` from it to stop generating early.
	pub fn callback_progress<F>(mut self, frequency: usize, callback: F) -> Self
	where
		F: Fn(usize) -> bool + 'static
	{
		self.callback = Some(ShortcutCallback::Progress { frequency, cb: Box::new(callback) });
		self
	}
	/// Receive each generated latent frame; return `false` to stop
	/// generating early.
	pub fn callback_frames<F>(mut self, frequency: usize, callback: F) -> Self
	where
		F: Fn(usize, ArrayView5<'_, f32>) -> bool + 'static
	{
		self.callback = Some(ShortcutCallback::Frames { frequency, cb: Box::new(callback) });
		self
	}
}

/// Where the initial history of a history-seeded sampler comes from.
///
/// Exactly one source must be supplied: in-memory latents, a pre-encoded
/// latent file, or raw pixel frames together with an encoder.
#[derive(Default)]
pub struct HistoryOptions {
	pub(crate) latents: Option<Array5<f32>>,
	pub(crate) encoded_path: Option<PathBuf>,
	pub(crate) frames: Option<Vec<DynamicImage>>,
	pub(crate) encoder: Option<Box<dyn FrameEncoder>>,
	pub(crate) sidecar: Option<PathBuf>
}

impl HistoryOptions {
	/// Use already-encoded history latents,
	/// `(1, window_length, channels, height, width)`.
	pub fn with_latents(mut self, latents: Array5<f32>) -> Self {
		self.latents = Some(latents);
		self
	}
	/// Load pre-encoded history latents from a JSON-serialized array file.
	pub fn with_encoded_path(mut self, path: impl Into<PathBuf>) -> Self {
		self.encoded_path = Some(path.into());
		self
	}
	/// Encode raw pixel frames into the history; requires
	/// [`HistoryOptions::with_encoder`].
	pub fn with_frames(mut self, frames: Vec<DynamicImage>) -> Self {
		self.frames = Some(frames);
		self
	}
	/// The encoder used for raw pixel frames.
	pub fn with_encoder(mut self, encoder: Box<dyn FrameEncoder>) -> Self {
		self.encoder = Some(encoder);
		self
	}
	/// Persist (and on later runs, reuse) the encoded history at `path` to
	/// avoid re-encoding. Best-effort: write failures are logged, not fatal.
	pub fn with_sidecar(mut self, path: impl Into<PathBuf>) -> Self {
		self.sidecar = Some(path.into());
		self
	}

	pub(crate) fn resolve(self, config: &WorldModelConfig, window_length: usize) -> anyhow::Result<Array5<f32>> {
		if let Some(latents) = self.latents {
			return validate_history(latents, config, window_length);
		}
		if let Some(path) = &self.encoded_path {
			return validate_history(load_latents(path)?, config, window_length);
		}
		let Some(frames) = self.frames else {
			return Err(RolloutError::Config("no history source supplied".to_string()).into());
		};
		let Some(encoder) = self.encoder else {
			return Err(RolloutError::Config("a raw-frame history source requires an encoder".to_string()).into());
		};

		if let Some(sidecar) = self.sidecar.as_ref().filter(|p| p.exists()) {
			match load_latents(sidecar) {
				Ok(latents) => return validate_history(latents, config, window_length),
				Err(err) => warn!("ignoring unreadable history sidecar {}: {err}", sidecar.display())
			}
		}

		let pixels = frames_to_tensor(&frames)?;
		let latents = validate_history(encoder.encode(pixels.view())?, config, window_length)?;

		// avoids re-encoding the history on subsequent runs
		if let Some(sidecar) = &self.sidecar {
			if let Err(err) = store_latents(sidecar, &latents) {
				warn!("failed to persist encoded history to {}: {err}", sidecar.display());
			}
		}
		Ok(latents)
	}
}

fn load_latents(path: &Path) -> anyhow::Result<Array5<f32>> {
	Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
}

fn store_latents(path: &Path, latents: &Array5<f32>) -> anyhow::Result<()> {
	fs::write(path, serde_json::to_string(latents)?)?;
	Ok(())
}

fn validate_history(latents: Array5<f32>, config: &WorldModelConfig, window_length: usize) -> anyhow::Result<Array5<f32>> {
	let expected = config.latent_shape(1, window_length);
	if latents.dim() != expected {
		return Err(RolloutError::shape_mismatch(format!("{expected:?}"), format!("{:?}", latents.shape())).into());
	}
	Ok(latents)
}

/// Trims the assembled sequence (and the matching action rows) when
/// `only_return_generated` is set, then decodes if a decoder is configured.
pub(crate) fn assemble_output(
	options: &ShortcutOptions,
	frames: Array5<f32>,
	mouse: Array3<f32>,
	buttons: Array3<f32>,
	n_generated: usize
) -> anyhow::Result<ShortcutOutput> {
	let total = frames.shape()[1];
	let (frames, mouse, buttons) = if options.only_return_generated {
		(
			frames.slice(s![.., total - n_generated.., .., .., ..]).to_owned(),
			mouse.slice(s![.., mouse.shape()[1] - n_generated.., ..]).to_owned(),
			buttons.slice(s![.., buttons.shape()[1] - n_generated.., ..]).to_owned()
		)
	} else {
		(frames, mouse, buttons)
	};

	let frames = match &options.decoder {
		Some(decoder) => SampledFrames::Pixels(decoder.decode((options.vae_scale * &frames).view())?),
		None => SampledFrames::Latents(frames)
	};
	Ok(ShortcutOutput { frames, mouse, buttons })
}

/// Sampled frames, in latent space or decoded to pixels.
#[derive(Debug, Clone)]
pub enum SampledFrames {
	/// Latent frames, `(batch, frames, channels, height, width)`.
	Latents(Array5<f32>),
	/// Decoded pixel frames, frame-major.
	Pixels(Vec<DynamicImage>)
}

/// The result of one `generate_frames` call.
#[derive(Debug, Clone)]
pub struct ShortcutOutput {
	/// The sampled frame sequence (history included unless
	/// `only_return_generated` is set).
	pub frames: SampledFrames,
	/// The mouse actions matching `frames`, extension and trimming included.
	pub mouse: Array3<f32>,
	/// The button actions matching `frames`, extension and trimming included.
	pub buttons: Array3<f32>
}
