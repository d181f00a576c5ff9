use thiserror::Error;

/// Errors produced by the rollout core.
///
/// Public APIs return [`anyhow::Result`], so callers that need to match on a
/// specific class can `downcast_ref::<RolloutError>()`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RolloutError {
	/// A tensor's declared dimensions disagree with the expected contract.
	/// Never silently broadcast or truncated.
	#[error("shape mismatch: expected {expected}, got {actual}")]
	ShapeMismatch {
		/// The shape the contract requires.
		expected: String,
		/// The shape that was actually supplied.
		actual: String
	},
	/// A required construction argument is missing or inconsistent.
	#[error("configuration error: {0}")]
	Config(String),
	/// An internal invariant no longer holds. Always fatal to the current
	/// rollout or sampler call.
	#[error("invariant violation: {0}")]
	InvariantViolation(String),
	/// A timestep lookup fell outside the schedule table's domain.
	#[error("timestep {timestep} out of schedule range 0..={max}")]
	OutOfRange {
		/// The offending timestep.
		timestep: u32,
		/// The largest valid timestep.
		max: u32
	}
}

impl RolloutError {
	pub(crate) fn shape_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
		Self::ShapeMismatch {
			expected: expected.into(),
			actual: actual.into()
		}
	}
}
