use ndarray::{Array3, Array5};
use pyke_rollout::{CachedShortcutSampler, HistoryOptions, RolloutError, SampledFrames, ShortcutOptions, WindowShortcutSampler};

mod common;
use common::{test_config, RecordingModel};

fn history(frames: usize) -> Array5<f32> {
	let config = test_config();
	Array5::zeros((1, frames, config.latent_channels, config.latent_height, config.latent_width))
}

fn actions(frames: usize) -> (Array3<f32>, Array3<f32>) {
	let config = test_config();
	(Array3::zeros((1, frames, config.mouse_axes)), Array3::zeros((1, frames, config.buttons)))
}

fn cached_sampler(window_length: usize, num_frames: usize) -> CachedShortcutSampler<RecordingModel> {
	let options = ShortcutOptions::default()
		.with_window_length(window_length)
		.with_num_frames(num_frames)
		.with_seed(7);
	CachedShortcutSampler::new(
		RecordingModel::new(test_config()),
		test_config(),
		options,
		HistoryOptions::default().with_latents(history(window_length))
	)
	.unwrap()
}

#[test]
fn history_source_is_required() {
	let err = CachedShortcutSampler::new(RecordingModel::new(test_config()), test_config(), ShortcutOptions::default(), HistoryOptions::default()).unwrap_err();
	assert!(matches!(err.downcast_ref::<RolloutError>(), Some(RolloutError::Config(_))));
}

#[test]
fn raw_frame_history_requires_an_encoder() {
	let frames = vec![image::DynamicImage::new_rgb8(6, 6); 4];
	let err = CachedShortcutSampler::new(
		RecordingModel::new(test_config()),
		test_config(),
		ShortcutOptions::default().with_window_length(4),
		HistoryOptions::default().with_frames(frames)
	)
	.unwrap_err();
	assert!(matches!(err.downcast_ref::<RolloutError>(), Some(RolloutError::Config(_))));
}

#[test]
fn history_shape_is_validated() {
	let err = CachedShortcutSampler::new(
		RecordingModel::new(test_config()),
		test_config(),
		ShortcutOptions::default().with_window_length(8),
		HistoryOptions::default().with_latents(history(6))
	)
	.unwrap_err();
	assert!(matches!(err.downcast_ref::<RolloutError>(), Some(RolloutError::ShapeMismatch { .. })));
}

#[test]
fn generating_before_seeding_is_an_error() {
	let mut sampler = cached_sampler(4, 1);
	let (mouse, buttons) = actions(4);
	let err = sampler.generate_frames(mouse.view(), buttons.view()).unwrap_err();
	assert!(matches!(err.downcast_ref::<RolloutError>(), Some(RolloutError::InvariantViolation(_))));
}

#[test]
fn seeding_twice_is_an_error() {
	let mut sampler = cached_sampler(4, 1);
	let (mouse, buttons) = actions(4);
	sampler.init_cache(mouse.view(), buttons.view()).unwrap();
	let err = sampler.init_cache(mouse.view(), buttons.view()).unwrap_err();
	assert!(matches!(err.downcast_ref::<RolloutError>(), Some(RolloutError::InvariantViolation(_))));

	sampler.reset_session();
	sampler.init_cache(mouse.view(), buttons.view()).unwrap();
}

#[test]
fn two_phase_generation_keeps_the_cache_bounded() {
	// spec scenario: window_length = 60, one generated frame
	let mut sampler = cached_sampler(60, 1);
	let (mouse, buttons) = actions(60);
	sampler.init_cache(mouse.view(), buttons.view()).unwrap();
	assert_eq!(sampler.cache().len().unwrap(), sampler.cache().capacity());

	sampler.generate_frames(mouse.view(), buttons.view()).unwrap();
	assert!(sampler.cache().len().unwrap() <= sampler.cache().capacity());

	// one seeding call plus the mandatory generate + reseed pair
	let calls = sampler.model().calls.borrow();
	assert_eq!(calls.len(), 3);
	assert_eq!(calls[0].recording, Some(true));
	assert!(!calls[1].had_video, "phase 1 generates from cache context alone");
	assert_eq!(calls[1].recording, Some(false));
	assert!(calls[2].had_video, "phase 2 replays the re-noised frame");
	assert_eq!(calls[2].recording, Some(true));
}

#[test]
fn cached_sampler_output_includes_history_and_extended_actions() {
	let mut sampler = cached_sampler(4, 3);
	let (mouse, buttons) = actions(4);
	sampler.init_cache(mouse.view(), buttons.view()).unwrap();
	let output = sampler.generate_frames(mouse.view(), buttons.view()).unwrap();

	let SampledFrames::Latents(frames) = output.frames else {
		panic!("no decoder configured, latents expected");
	};
	assert_eq!(frames.shape(), &[1, 7, 2, 3, 3]);
	assert_eq!(output.mouse.shape(), &[1, 7, 2]);
	assert_eq!(output.buttons.shape(), &[1, 7, 11]);
}

#[test]
fn only_return_generated_trims_frames_and_actions() {
	let options = ShortcutOptions::default()
		.with_window_length(4)
		.with_num_frames(2)
		.only_return_generated(true)
		.with_seed(7);
	let mut sampler = CachedShortcutSampler::new(
		RecordingModel::new(test_config()),
		test_config(),
		options,
		HistoryOptions::default().with_latents(history(4))
	)
	.unwrap();
	let (mouse, buttons) = actions(4);
	sampler.init_cache(mouse.view(), buttons.view()).unwrap();
	let output = sampler.generate_frames(mouse.view(), buttons.view()).unwrap();

	let SampledFrames::Latents(frames) = output.frames else {
		panic!("no decoder configured, latents expected");
	};
	assert_eq!(frames.shape(), &[1, 2, 2, 3, 3]);
	assert_eq!(output.mouse.shape(), &[1, 2, 2]);
	assert_eq!(output.buttons.shape(), &[1, 2, 11]);
}

#[test]
fn keyframe_defaults_to_first_history_frame() {
	let mut sampler = cached_sampler(4, 1);
	let (mouse, buttons) = actions(4);
	sampler.init_cache(mouse.view(), buttons.view()).unwrap();
	sampler.generate_frames(mouse.view(), buttons.view()).unwrap();
	assert!(sampler.model().calls.borrow().iter().all(|c| c.had_keyframe));
}

#[test]
fn progress_callback_can_stop_generation_early() {
	let options = ShortcutOptions::default()
		.with_window_length(4)
		.with_num_frames(5)
		.only_return_generated(true)
		.with_seed(7)
		.callback_progress(1, |frame| frame < 1);
	let mut sampler = CachedShortcutSampler::new(
		RecordingModel::new(test_config()),
		test_config(),
		options,
		HistoryOptions::default().with_latents(history(4))
	)
	.unwrap();
	let (mouse, buttons) = actions(4);
	sampler.init_cache(mouse.view(), buttons.view()).unwrap();
	let output = sampler.generate_frames(mouse.view(), buttons.view()).unwrap();

	let SampledFrames::Latents(frames) = output.frames else {
		panic!("no decoder configured, latents expected");
	};
	assert_eq!(frames.shape()[1], 2);
}

#[test]
fn window_sampler_slides_without_a_cache() {
	let options = ShortcutOptions::default().with_window_length(4).with_num_frames(3).with_seed(7);
	let mut sampler = WindowShortcutSampler::new(RecordingModel::new(test_config()), test_config(), options, history(6)).unwrap();
	let (mouse, buttons) = actions(7);
	let output = sampler.generate_frames(mouse.view(), buttons.view()).unwrap();

	let SampledFrames::Latents(frames) = output.frames else {
		panic!("no decoder configured, latents expected");
	};
	// full history plus the three generated frames
	assert_eq!(frames.shape(), &[1, 9, 2, 3, 3]);
	assert_eq!(sampler.window().shape()[1], 7);

	let calls = sampler.model().calls.borrow();
	assert_eq!(calls.len(), 3);
	for call in calls.iter() {
		assert_eq!(call.recording, None, "the window sampler never touches a cache");
		assert_eq!(call.frame_slots, 4);
	}
}

#[test]
fn window_sampler_requires_enough_history() {
	let options = ShortcutOptions::default().with_window_length(8);
	let err = WindowShortcutSampler::new(RecordingModel::new(test_config()), test_config(), options, history(4)).unwrap_err();
	assert!(matches!(err.downcast_ref::<RolloutError>(), Some(RolloutError::ShapeMismatch { .. })));
}
