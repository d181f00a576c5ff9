//! `pyke-rollout` is a streaming rollout engine for interactive latent-video
//! diffusion world models.
//!
//! Frames are generated one at a time by iteratively denoising a noisy latent
//! conditioned on user actions and on a bounded window of previously
//! generated frames held in a rolling context cache. The engine owns the
//! orchestration — step schedules, cache recording and truncation, the
//! gradient horizon, and re-noising — while the neural network itself stays
//! behind the [`WorldModel`] trait.
//!
//! ```ignore
//! use pyke_rollout::{RolloutMode, SelfForcingOptions, SelfForcingSampler, WorldModelConfig};
//!
//! let config = WorldModelConfig::from_file("./world-model/rollout.json")?;
//! let mut sampler = SelfForcingSampler::new(
//! 	model,
//! 	config,
//! 	SelfForcingOptions::default()
//! 		.with_num_frames(64)
//! 		.with_context_frames(48)
//! 		.with_gradient_cutoff(8)
//! 		.with_mode(RolloutMode::Training)
//! )?;
//!
//! let output = sampler.rollout(&conditioning, None)?;
//! ```
//!
//! For interactive sessions, see [`CachedShortcutSampler`], which seeds a
//! persistent cache from real history and then generates and re-seeds one
//! frame per call.

#![warn(missing_docs)]
#![warn(rustdoc::all)]
#![warn(clippy::correctness, clippy::suspicious, clippy::complexity, clippy::perf, clippy::style)]
#![allow(clippy::tabs_in_doc_comments)]

pub mod cache;
pub(crate) mod config;
pub(crate) mod error;
pub mod model;
pub mod samplers;
pub mod schedulers;
pub(crate) mod util;

pub use self::cache::KvCache;
pub use self::config::WorldModelConfig;
pub use self::error::RolloutError;
pub use self::model::{AudioLatent, ConditioningFrame, FrameEncoder, Latent, LatentDecoder, ModelInput, ModelOutput, Timesteps, Tracked, WorldModel};
pub use self::samplers::*;
pub use self::schedulers::*;
