use anyhow::Context;
use ndarray::{Array, Array1, ArrayView, ArrayView1, Dimension};
use ndarray_rand::{rand_distr::StandardNormal, RandomExt};
use rand::Rng;

use crate::RolloutError;

/// Precomputed flow-matching noise schedule table.
///
/// Maps an integer timestep `t` in `0..=num_timesteps` to a noise level
/// `sigma(t)` with `sigma(0) == 0` (noiseless) and `sigma(num_timesteps) ==
/// 1` (pure noise), and `alpha(t) = sqrt(1 - sigma(t)²)`.
///
/// The table is an explicit immutable value: construct it once and pass it by
/// reference to every component that needs it.
#[derive(Debug, Clone)]
pub struct FlowMatchSchedule {
	sigmas: Array1<f32>,
	num_timesteps: u32
}

impl Default for FlowMatchSchedule {
	fn default() -> Self {
		Self::new(1000, 1.0).unwrap()
	}
}

impl FlowMatchSchedule {
	/// Creates a new schedule table.
	///
	/// # Parameters
	/// - **`num_timesteps`**: number of diffusion timesteps the model was
	///   trained with; the table's domain is `0..=num_timesteps`.
	/// - **`shift`**: timestep-shift factor; `1.0` leaves the sigmas linear
	///   in `t`.
	///
	/// # Errors
	/// Can error if `num_timesteps` is 0, or `shift` is not a positive normal
	/// number.
	pub fn new(num_timesteps: u32, shift: f32) -> anyhow::Result<Self> {
		if num_timesteps == 0 {
			anyhow::bail!("num_timesteps ({num_timesteps}) must be >0");
		}
		if !shift.is_normal() || shift <= 0.0 {
			anyhow::bail!("shift ({shift}) must be a positive normal number");
		}

		let mut sigmas = Array1::linspace(0.0, 1.0, num_timesteps as usize + 1);
		if shift != 1.0 {
			sigmas.par_map_inplace(|s| *s = shift * *s / (1.0 + (shift - 1.0) * *s));
		}

		Ok(Self { sigmas, num_timesteps })
	}

	/// The largest valid timestep.
	pub fn num_timesteps(&self) -> u32 {
		self.num_timesteps
	}

	/// Noise level at `t`.
	///
	/// # Errors
	/// [`RolloutError::OutOfRange`] for `t > num_timesteps` — the table never
	/// clamps silently.
	pub fn sigma(&self, t: u32) -> anyhow::Result<f32> {
		if t > self.num_timesteps {
			return Err(RolloutError::OutOfRange {
				timestep: t,
				max: self.num_timesteps
			}
			.into());
		}
		Ok(self.sigmas[t as usize])
	}

	/// Signal level at `t`: `sqrt(1 - sigma(t)²)`.
	pub fn alpha(&self, t: u32) -> anyhow::Result<f32> {
		let sigma = self.sigma(t)?;
		Ok((1.0 - sigma * sigma).sqrt())
	}

	/// Looks up the noise level for a per-batch timestep vector.
	///
	/// Every batch element shares one timestep by contract, so only the first
	/// element is read.
	pub fn sigma_shared(&self, t: ArrayView1<'_, u32>) -> anyhow::Result<f32> {
		let first = t.first().copied().context("timestep vector must be non-empty")?;
		self.sigma(first)
	}

	/// Forward diffusion: re-noises a clean estimate to timestep `t`.
	///
	/// Returns `(alpha(t)·x + sigma(t)·eps, eps)` with `eps ~ N(0, 1)`.
	pub fn q_sample<D, R>(&self, x: &ArrayView<'_, f32, D>, t: u32, rng: &mut R) -> anyhow::Result<(Array<f32, D>, Array<f32, D>)>
	where
		D: Dimension,
		R: Rng + ?Sized
	{
		let alpha = self.alpha(t)?;
		let sigma = self.sigma(t)?;
		let eps = Array::<f32, D>::random_using(x.raw_dim(), StandardNormal, rng);
		let noisy = alpha * &x.to_owned() + sigma * &eps;
		Ok((noisy, eps))
	}
}

/// Alpha-blend between a signal and fresh Gaussian noise:
/// `x·(1 - blend) + z·blend`, `z ~ N(0, 1)`.
///
/// Used by the interactive samplers to re-seed the cache between generated
/// frames.
pub fn zlerp<D, R>(x: ArrayView<'_, f32, D>, blend: f32, rng: &mut R) -> Array<f32, D>
where
	D: Dimension,
	R: Rng + ?Sized
{
	let z = Array::<f32, D>::random_using(x.raw_dim(), StandardNormal, rng);
	(1.0 - blend) * &x.to_owned() + blend * &z
}
