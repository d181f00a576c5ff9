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

use image::DynamicImage;
use ndarray::Array5;

use crate::RolloutError;

/// Converts raw pixel frames into a `(1, frames, 3, height, width)` float
/// tensor in `[-1, 1]`, ready for a [`crate::model::FrameEncoder`].
///
/// All frames must share the dimensions of the first.
pub(crate) fn frames_to_tensor(frames: &[DynamicImage]) -> anyhow::Result<Array5<f32>> {
	let first = frames
		.first()
		.ok_or_else(|| RolloutError::shape_mismatch("at least one frame", "0 frames"))?;
	let (width, height) = (first.width(), first.height());

	let mut planes = Vec::with_capacity(frames.len());
	for (i, frame) in frames.iter().enumerate() {
		if frame.width() != width || frame.height() != height {
			return Err(RolloutError::shape_mismatch(format!("{width}x{height}"), format!("{}x{} (frame {i})", frame.width(), frame.height())).into());
		}
		planes.push(frame.to_rgb32f());
	}

	// whc -> nchw, [0, 1] -> [-1, 1]
	Ok(Array5::from_shape_fn((1, planes.len(), 3, height as usize, width as usize), |(_, n, c, y, x)| {
		planes[n].get_pixel(x as u32, y as u32).0[c] * 2.0 - 1.0
	}))
}
