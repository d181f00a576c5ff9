//! Contracts for the external collaborators of the rollout core: the world
//! model itself, and the autoencoder pair used to enter and leave pixel space.
//!
//! The rollout engine never looks inside the model; it only toggles cache
//! recording, threads [`Tracked`] tensors through [`WorldModel::forward`], and
//! applies the schedule. Gradient retention is likewise a *signal*: the engine
//! sets the `requires_grad` flag on the tensors it passes in, and the autograd
//! machinery behind the trait implementation is required to honor it.

use image::DynamicImage;
use ndarray::{Array, Array1, ArrayView, ArrayView3, ArrayView5, Dimension, Ix3, Ix5};
use num_traits::ToPrimitive;

use crate::cache::KvCache;

/// A tensor annotated with a gradient-retention flag.
///
/// `requires_grad` tells the model implementation whether this input is a
/// fresh computation root that should re-enter the autograd graph. The flag
/// is cleared by [`Tracked::detach`] and never survives concatenation into a
/// final output.
#[derive(Debug, Clone)]
pub struct Tracked<D: Dimension> {
	data: Array<f32, D>,
	requires_grad: bool
}

/// A video latent sequence, shaped `(batch, frames, channels, height, width)`.
pub type Latent = Tracked<Ix5>;
/// An audio latent sequence, shaped `(batch, frames, audio_channels)`.
pub type AudioLatent = Tracked<Ix3>;

impl<D: Dimension> Tracked<D> {
	/// Wraps `data` detached (no gradient retention).
	pub fn new(data: Array<f32, D>) -> Self {
		Self { data, requires_grad: false }
	}

	/// Wraps `data` with an explicit gradient-retention flag.
	pub fn from_parts(data: Array<f32, D>, requires_grad: bool) -> Self {
		Self { data, requires_grad }
	}

	/// Whether this tensor participates in gradient tracking.
	pub fn requires_grad(&self) -> bool {
		self.requires_grad
	}

	/// Clears the gradient-retention flag in place.
	pub fn detach(&mut self) {
		self.requires_grad = false;
	}

	/// Returns a detached copy.
	pub fn detached(&self) -> Self {
		Self {
			data: self.data.clone(),
			requires_grad: false
		}
	}

	/// Re-attaches (or clears) gradient tracking.
	pub fn set_requires_grad(&mut self, requires_grad: bool) {
		self.requires_grad = requires_grad;
	}

	/// Borrows the underlying array.
	pub fn data(&self) -> &Array<f32, D> {
		&self.data
	}

	/// Views the underlying array.
	pub fn view(&self) -> ArrayView<'_, f32, D> {
		self.data.view()
	}

	/// Consumes the wrapper, returning the underlying array.
	pub fn into_data(self) -> Array<f32, D> {
		self.data
	}
}

/// Timestep input for one forward pass.
#[derive(Debug, Clone)]
pub enum Timesteps {
	/// A single integer timestep shared by every batch element and frame slot.
	/// `Uniform(0)` marks already-denoised context (warm-up replay).
	Uniform(u32),
	/// Per-frame-slot fractional noise levels and denoising step budgets, as
	/// used by the collapsed shortcut samplers (e.g. noise level `0.25` with a
	/// 4-step budget for context slots, `1.0` with a 1-step budget for the
	/// slot being generated).
	PerSlot {
		/// Noise level in `[0, 1]` per frame slot.
		noise_levels: Array1<f32>,
		/// Denoising step budget per frame slot.
		step_budgets: Array1<f32>
	}
}

impl Timesteps {
	/// The shared timestep as a float, for models that embed it directly.
	/// `None` for per-slot timesteps.
	pub fn uniform_value(&self) -> Option<f32> {
		match self {
			Self::Uniform(t) => t.to_f32(),
			Self::PerSlot { .. } => None
		}
	}
}

/// Read-only per-frame conditioning views passed to the model.
#[derive(Debug, Clone, Copy)]
pub struct ConditioningFrame<'a> {
	/// Mouse axes, `(batch, frames, mouse_axes)`.
	pub mouse: ArrayView3<'a, f32>,
	/// Button states, `(batch, frames, buttons)`.
	pub buttons: ArrayView3<'a, f32>,
	/// User audio conditioning, `(batch, frames, audio_channels)`, when the
	/// model has an audio head.
	pub audio: Option<ArrayView3<'a, f32>>
}

/// One forward-pass request.
#[derive(Debug, Clone)]
pub struct ModelInput<'a> {
	/// Noisy video latents to denoise, or `None` for the collapsed one-step
	/// generation call of the cached shortcut sampler (the model generates
	/// the next slot purely from cache context and conditioning).
	pub video: Option<&'a Latent>,
	/// Noisy audio latents carried over from the previous denoising step.
	pub audio: Option<&'a AudioLatent>,
	/// Optional keyframe conditioning, `(batch, 1, channels, height, width)`.
	pub keyframe: Option<&'a Latent>,
	/// The timestep(s) this pass denoises at.
	pub timesteps: Timesteps,
	/// Per-frame user conditioning.
	pub conditioning: ConditioningFrame<'a>
}

/// Denoised estimates returned by one forward pass.
#[derive(Debug, Clone)]
pub struct ModelOutput {
	/// Denoised video estimate (`x_0`), same shape as the video input.
	pub video: Latent,
	/// Denoised audio estimate, when the model has an audio head.
	pub audio: Option<AudioLatent>
}

/// The neural world model, treated as an opaque collaborator.
///
/// Implementations must append to `cache` **iff** recording is enabled (the
/// cache itself also enforces this: [`KvCache::push`] is a no-op while
/// frozen), and must accept `video: None` together with a unit timestep for
/// warm-up replay and one-step generation.
pub trait WorldModel {
	/// Runs one denoising forward pass.
	fn forward(&self, input: ModelInput<'_>, cache: Option<&mut KvCache>) -> anyhow::Result<ModelOutput>;
}

/// Decodes scaled latents back to pixel frames. Applied only when a sampler
/// is configured with a decoder; latents are multiplied by the sampler's
/// `vae_scale` beforehand.
pub trait LatentDecoder {
	/// Decodes `(batch, frames, channels, height, width)` latents into one
	/// image per `(batch, frame)` pair, frame-major.
	fn decode(&self, latents: ArrayView5<'_, f32>) -> anyhow::Result<Vec<DynamicImage>>;
}

/// Encodes pixel frames into the latent space.
pub trait FrameEncoder {
	/// Encodes `(1, frames, 3, height, width)` pixel tensors in `[-1, 1]`
	/// into `(1, frames, channels, latent_height, latent_width)` latents.
	fn encode(&self, frames: ArrayView5<'_, f32>) -> anyhow::Result<ndarray::Array5<f32>>;
}
