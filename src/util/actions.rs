use ndarray::{Array3, ArrayView3, Axis};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::RolloutError;

/// Extends an action history to `target` frames by replaying the supplied
/// rows in freshly shuffled order until the target length is reached; mouse
/// and button sequences share the same replay indices so paired actions stay
/// paired. A history already at or beyond `target` is sliced down to it.
pub(crate) fn extend_to_length<R: Rng + ?Sized>(
	mouse: ArrayView3<'_, f32>,
	buttons: ArrayView3<'_, f32>,
	target: usize,
	rng: &mut R
) -> anyhow::Result<(Array3<f32>, Array3<f32>)> {
	let frames = mouse.shape()[1];
	if buttons.shape()[1] != frames || buttons.shape()[0] != mouse.shape()[0] {
		return Err(RolloutError::shape_mismatch(
			format!("buttons with (batch, frames) = ({}, {frames})", mouse.shape()[0]),
			format!("{:?}", buttons.shape())
		)
		.into());
	}
	if frames == 0 {
		return Err(RolloutError::shape_mismatch("at least one action frame", "0 frames").into());
	}

	let mut indices: Vec<usize> = (0..frames).collect();
	while indices.len() < target {
		let mut replay: Vec<usize> = (0..frames).collect();
		replay.shuffle(rng);
		indices.extend(replay);
	}
	indices.truncate(target);

	Ok((mouse.select(Axis(1), &indices), buttons.select(Axis(1), &indices)))
}
