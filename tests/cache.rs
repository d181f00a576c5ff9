use ndarray::Array3;
use pyke_rollout::{KvCache, RolloutError};

mod common;
use common::test_config;

fn frame_tokens(value: f32, frames: usize) -> Array3<f32> {
	let config = test_config();
	Array3::from_elem((1, frames * config.tokens_per_frame, config.model_width), value)
}

fn push_frame(cache: &mut KvCache, value: f32) {
	let tokens = frame_tokens(value, 1);
	for layer in 0..test_config().layers {
		cache.push(layer, tokens.view(), tokens.view()).unwrap();
	}
}

#[test]
fn reset_is_idempotent() {
	let mut cache = KvCache::new(&test_config(), 4);
	cache.reset(1);
	cache.enable_updates();
	push_frame(&mut cache, 1.0);
	cache.reset(1);
	assert_eq!(cache.len().unwrap(), 0);
	assert!(!cache.is_recording());
	cache.reset(1);
	assert_eq!(cache.len().unwrap(), 0);
	assert!(!cache.is_recording());
}

#[test]
fn frozen_cache_is_never_mutated() {
	let mut cache = KvCache::new(&test_config(), 4);
	cache.reset(1);
	push_frame(&mut cache, 1.0);
	assert_eq!(cache.len().unwrap(), 0);

	cache.enable_updates();
	push_frame(&mut cache, 1.0);
	cache.disable_updates();
	push_frame(&mut cache, 2.0);
	assert_eq!(cache.len().unwrap(), test_config().tokens_per_frame);
}

#[test]
fn pushing_before_reset_is_an_invariant_violation() {
	let mut cache = KvCache::new(&test_config(), 4);
	cache.enable_updates();
	let tokens = frame_tokens(1.0, 1);
	let err = cache.push(0, tokens.view(), tokens.view()).unwrap_err();
	assert!(matches!(err.downcast_ref::<RolloutError>(), Some(RolloutError::InvariantViolation(_))));
}

#[test]
fn cross_layer_mismatch_is_fatal() {
	let mut cache = KvCache::new(&test_config(), 4);
	cache.reset(1);
	cache.enable_updates();
	let tokens = frame_tokens(1.0, 1);
	// a model writing to only one layer violates the push contract
	cache.push(0, tokens.view(), tokens.view()).unwrap();
	let err = cache.len().unwrap_err();
	assert!(matches!(err.downcast_ref::<RolloutError>(), Some(RolloutError::InvariantViolation(_))));
}

#[test]
fn overdraining_truncate_clamps_to_empty() {
	let mut cache = KvCache::new(&test_config(), 4);
	cache.reset(1);
	cache.enable_updates();
	push_frame(&mut cache, 1.0);
	cache.truncate(3);
	assert_eq!(cache.len().unwrap(), 0);
}

#[test]
fn truncate_zero_is_a_noop() {
	let mut cache = KvCache::new(&test_config(), 4);
	cache.reset(1);
	cache.enable_updates();
	push_frame(&mut cache, 1.0);
	cache.truncate(0);
	assert_eq!(cache.len().unwrap(), test_config().tokens_per_frame);
}

#[test]
fn overflow_evicts_oldest_frames_first() {
	let config = test_config();
	// context_frames = 4, tokens_per_frame = 10
	let mut cache = KvCache::new(&config, 4);
	cache.reset(1);
	cache.enable_updates();

	for frame in 0..5 {
		push_frame(&mut cache, frame as f32);
		cache.enforce_capacity().unwrap();
	}

	assert_eq!(cache.len().unwrap(), 4 * config.tokens_per_frame);
	// frame 0 was evicted; the oldest surviving token belongs to frame 1
	let (k, _) = cache.layer(0).unwrap();
	assert_eq!(k[[0, 0, 0]], 1.0);
	assert_eq!(k[[0, k.shape()[1] - 1, 0]], 4.0);
}

#[test]
fn capacity_lags_by_at_most_one_push() {
	let config = test_config();
	let mut cache = KvCache::new(&config, 2);
	cache.reset(1);
	cache.enable_updates();

	for frame in 0..3 {
		push_frame(&mut cache, frame as f32);
	}
	assert_eq!(cache.len().unwrap(), 3 * config.tokens_per_frame);
	assert_eq!(cache.enforce_capacity().unwrap(), 1);
	assert_eq!(cache.len().unwrap(), cache.capacity());
	assert_eq!(cache.enforce_capacity().unwrap(), 0);
}

#[test]
fn multi_frame_pushes_are_trimmed_to_whole_frames() {
	let config = test_config();
	let mut cache = KvCache::new(&config, 4);
	cache.reset(1);
	cache.enable_updates();

	// a warm-up style push of 6 frames at once
	let tokens = frame_tokens(0.5, 6);
	for layer in 0..config.layers {
		cache.push(layer, tokens.view(), tokens.view()).unwrap();
	}
	assert_eq!(cache.enforce_capacity().unwrap(), 2);
	assert_eq!(cache.len().unwrap(), cache.capacity());
}
