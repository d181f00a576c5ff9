//! The rolling context cache: a capacity-bounded, append-then-truncate store
//! of per-layer key/value token representations.
//!
//! The cache has two modes. While **recording**, every model forward pass
//! appends its new tokens via [`KvCache::push`]; while **frozen**, pushes are
//! no-ops, so a forward pass can read context without mutating it. The engine
//! driving the cache is solely responsible for toggling recording around each
//! model invocation and for truncation — the model never truncates.

use ndarray::{concatenate, s, Array3, ArrayView3, Axis};
use tracing::warn;

use crate::{RolloutError, WorldModelConfig};

/// One layer's key/value token buffers, shaped `(batch, tokens, model_width)`.
#[derive(Debug, Clone)]
struct LayerKv {
	k: Array3<f32>,
	v: Array3<f32>
}

/// Rolling key/value context cache for a full transformer stack.
///
/// Token count never exceeds `context_frames × tokens_per_frame` once
/// [`KvCache::enforce_capacity`] has run; truncation removes whole frames'
/// worth of tokens from the front (oldest first).
///
/// A cache belongs to exactly one generation session. It is a single-writer
/// resource; `&mut` receivers make the at-most-one-in-flight-recording rule
/// a compile-time guarantee.
#[derive(Debug, Clone)]
pub struct KvCache {
	layers: Vec<LayerKv>,
	num_layers: usize,
	model_width: usize,
	tokens_per_frame: usize,
	context_frames: usize,
	batch_size: Option<usize>,
	recording: bool
}

impl KvCache {
	/// Creates an unseeded cache for the given model geometry and context
	/// window (in frames). [`KvCache::reset`] must run before the first push.
	pub fn new(config: &WorldModelConfig, context_frames: usize) -> Self {
		Self {
			layers: Vec::new(),
			num_layers: config.layers,
			model_width: config.model_width,
			tokens_per_frame: config.tokens_per_frame,
			context_frames,
			batch_size: None,
			recording: false
		}
	}

	/// Discards all stored state and re-initializes empty per-layer buffers
	/// sized for `batch_size`. Idempotent; callable regardless of prior state.
	pub fn reset(&mut self, batch_size: usize) {
		self.layers = (0..self.num_layers)
			.map(|_| LayerKv {
				k: Array3::zeros((batch_size, 0, self.model_width)),
				v: Array3::zeros((batch_size, 0, self.model_width))
			})
			.collect();
		self.batch_size = Some(batch_size);
		self.recording = false;
	}

	/// Enables append-on-forward.
	pub fn enable_updates(&mut self) {
		self.recording = true;
	}

	/// Disables append-on-forward; subsequent pushes are no-ops.
	pub fn disable_updates(&mut self) {
		self.recording = false;
	}

	/// Whether pushes currently append.
	pub fn is_recording(&self) -> bool {
		self.recording
	}

	/// Appends `k`/`v` tokens to `layer`'s buffers.
	///
	/// While frozen this is a no-op, which makes read-only forward passes
	/// leave the cache bit-for-bit unchanged even if the model calls it.
	///
	/// # Errors
	/// Fails with [`RolloutError::InvariantViolation`] if the cache was never
	/// [`reset`](KvCache::reset), and with [`RolloutError::ShapeMismatch`] if
	/// `layer` is out of bounds or the token shapes disagree with the cache
	/// geometry.
	pub fn push(&mut self, layer: usize, k: ArrayView3<'_, f32>, v: ArrayView3<'_, f32>) -> anyhow::Result<()> {
		if !self.recording {
			return Ok(());
		}
		let batch_size = self
			.batch_size
			.ok_or_else(|| RolloutError::InvariantViolation("cache pushed before being reset".to_string()))?;
		if layer >= self.num_layers {
			return Err(RolloutError::shape_mismatch(format!("layer < {}", self.num_layers), format!("layer {layer}")).into());
		}
		if k.shape() != v.shape() {
			return Err(RolloutError::shape_mismatch(format!("{:?}", k.shape()), format!("{:?}", v.shape())).into());
		}
		if k.shape()[0] != batch_size || k.shape()[2] != self.model_width {
			return Err(RolloutError::shape_mismatch(format!("({batch_size}, _, {})", self.model_width), format!("{:?}", k.shape())).into());
		}

		let entry = &mut self.layers[layer];
		entry.k = concatenate![Axis(1), entry.k.view(), k];
		entry.v = concatenate![Axis(1), entry.v.view(), v];
		Ok(())
	}

	/// Removes the oldest `n_frames × tokens_per_frame` tokens from every
	/// layer's buffers. No-op for `n_frames == 0`.
	///
	/// Draining more tokens than are present clamps to empty — this can
	/// legitimately happen during cache warm-up, so it is reported as a
	/// warning rather than an error.
	pub fn truncate(&mut self, n_frames: usize) {
		if n_frames == 0 {
			return;
		}
		let requested = n_frames * self.tokens_per_frame;
		for entry in &mut self.layers {
			let present = entry.k.shape()[1];
			let drop = requested.min(present);
			if drop < requested {
				warn!(requested, present, "cache truncation clamped to available tokens");
			}
			entry.k = entry.k.slice(s![.., drop.., ..]).to_owned();
			entry.v = entry.v.slice(s![.., drop.., ..]).to_owned();
		}
	}

	/// Current token count along the authoritative (token) axis.
	///
	/// # Errors
	/// Querying a cache that was never [`reset`](KvCache::reset) is a
	/// [`RolloutError::InvariantViolation`], as is a key/value or cross-layer
	/// length mismatch (the model violated the push contract).
	pub fn len(&self) -> anyhow::Result<usize> {
		if self.batch_size.is_none() {
			return Err(RolloutError::InvariantViolation("cache queried before being reset".to_string()).into());
		}
		let mut tokens = None;
		for (i, entry) in self.layers.iter().enumerate() {
			let k_tokens = entry.k.shape()[1];
			if entry.v.shape()[1] != k_tokens {
				return Err(RolloutError::InvariantViolation(format!(
					"layer {i} k/v token counts diverged ({k_tokens} != {})",
					entry.v.shape()[1]
				))
				.into());
			}
			match tokens {
				None => tokens = Some(k_tokens),
				Some(t) if t != k_tokens => {
					return Err(RolloutError::InvariantViolation(format!("layer {i} holds {k_tokens} tokens, expected {t}")).into());
				}
				Some(_) => {}
			}
		}
		Ok(tokens.unwrap_or(0))
	}

	/// Whether the cache currently holds no tokens.
	pub fn is_empty(&self) -> anyhow::Result<bool> {
		Ok(self.len()? == 0)
	}

	/// Maximum token count: `context_frames × tokens_per_frame`.
	pub fn capacity(&self) -> usize {
		self.context_frames * self.tokens_per_frame
	}

	/// Drops just enough whole frames to bring the token count back within
	/// capacity, returning how many frames were dropped.
	///
	/// Called after each recorded forward pass, so occupancy lags capacity by
	/// at most one pass's worth of excess.
	pub fn enforce_capacity(&mut self) -> anyhow::Result<usize> {
		let overflow = self.len()?.saturating_sub(self.capacity());
		if overflow == 0 {
			return Ok(0);
		}
		let drop = (overflow + self.tokens_per_frame - 1) / self.tokens_per_frame;
		self.truncate(drop);
		Ok(drop)
	}

	/// Reads one layer's `(k, v)` buffers, for the model's attention over
	/// cached context. `None` before [`reset`](KvCache::reset) or for an
	/// out-of-bounds layer.
	pub fn layer(&self, layer: usize) -> Option<(ArrayView3<'_, f32>, ArrayView3<'_, f32>)> {
		self.layers.get(layer).map(|entry| (entry.k.view(), entry.v.view()))
	}

	/// The context window size, in frames.
	pub fn context_frames(&self) -> usize {
		self.context_frames
	}

	/// Tokens one frame occupies.
	pub fn tokens_per_frame(&self) -> usize {
		self.tokens_per_frame
	}
}
