//! The samplers that orchestrate frame generation against a world model.
//!
//! [`SelfForcingSampler`] is the autoregressive rollout engine used for
//! training-time distillation targets and batch inference; the shortcut
//! samplers serve interactive sessions with a persistent (or window-only)
//! context across per-frame calls.

use ndarray::{s, Array3};

mod self_forcing;
pub use self::self_forcing::*;

cfg_if::cfg_if! {
	if #[cfg(feature = "sampler-shortcut")] {
		mod shortcut;
		pub use self::shortcut::*;
	}
}

use crate::model::ConditioningFrame;
use crate::RolloutError;

/// Per-frame user conditioning for a full generation run: mouse axes, button
/// states, and audio, each shaped `(batch, frames, dim)`.
///
/// Read-only to the core; all three sequences must agree on batch size and
/// frame count.
#[derive(Debug, Clone)]
pub struct Conditioning {
	/// Mouse axes, `(batch, frames, mouse_axes)`.
	pub mouse: Array3<f32>,
	/// Button states, `(batch, frames, buttons)`.
	pub buttons: Array3<f32>,
	/// User audio, `(batch, frames, audio_channels)`.
	pub audio: Array3<f32>
}

impl Conditioning {
	/// Bundles the three conditioning sequences.
	pub fn new(mouse: Array3<f32>, buttons: Array3<f32>, audio: Array3<f32>) -> Self {
		Self { mouse, buttons, audio }
	}

	/// The agreed frame count.
	///
	/// # Errors
	/// [`RolloutError::ShapeMismatch`] if the three sequences disagree on
	/// batch size or frame count.
	pub fn num_frames(&self) -> anyhow::Result<usize> {
		let (batch, frames) = (self.mouse.shape()[0], self.mouse.shape()[1]);
		for (name, shape) in [("buttons", self.buttons.shape()), ("audio", self.audio.shape())] {
			if shape[0] != batch || shape[1] != frames {
				return Err(RolloutError::shape_mismatch(format!("{name} with (batch, frames) = ({batch}, {frames})"), format!("{shape:?}")).into());
			}
		}
		Ok(frames)
	}

	/// The agreed batch size.
	pub fn batch_size(&self) -> anyhow::Result<usize> {
		self.num_frames()?;
		Ok(self.mouse.shape()[0])
	}

	/// Views frame `i` as a single-frame conditioning slice for one model
	/// call.
	pub(crate) fn frame(&self, i: usize) -> ConditioningFrame<'_> {
		ConditioningFrame {
			mouse: self.mouse.slice(s![.., i..i + 1, ..]),
			buttons: self.buttons.slice(s![.., i..i + 1, ..]),
			audio: Some(self.audio.slice(s![.., i..i + 1, ..]))
		}
	}
}
