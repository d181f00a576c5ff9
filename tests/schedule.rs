use ndarray::{Array1, Array4};
use pyke_rollout::{zlerp, FlowMatchSchedule, RolloutError, StepSchedule};
use rand::rngs::StdRng;
use rand::SeedableRng;

#[test]
fn alpha_sigma_unit_circle() {
	let table = FlowMatchSchedule::default();
	for t in 0..=table.num_timesteps() {
		let alpha = table.alpha(t).unwrap();
		let sigma = table.sigma(t).unwrap();
		assert!((alpha * alpha + sigma * sigma - 1.0).abs() < 1e-5, "alpha² + sigma² != 1 at t={t}");
	}
}

#[test]
fn terminal_timestep_is_noiseless() {
	let table = FlowMatchSchedule::default();
	assert_eq!(table.sigma(0).unwrap(), 0.0);
	assert_eq!(table.alpha(0).unwrap(), 1.0);
}

#[test]
fn shifted_table_keeps_endpoints() {
	let table = FlowMatchSchedule::new(1000, 3.0).unwrap();
	assert_eq!(table.sigma(0).unwrap(), 0.0);
	assert!((table.sigma(1000).unwrap() - 1.0).abs() < 1e-6);
}

#[test]
fn out_of_range_timestep_is_an_error() {
	let table = FlowMatchSchedule::new(1000, 1.0).unwrap();
	let err = table.sigma(1001).unwrap_err();
	assert!(matches!(err.downcast_ref::<RolloutError>(), Some(RolloutError::OutOfRange { timestep: 1001, max: 1000 })));
}

#[test]
fn shared_batch_lookup_reads_first_row() {
	let table = FlowMatchSchedule::default();
	let t = Array1::from_elem(4, 500_u32);
	assert_eq!(table.sigma_shared(t.view()).unwrap(), table.sigma(500).unwrap());
	assert!(table.sigma_shared(Array1::from_vec(vec![]).view()).is_err());
}

#[test]
fn q_sample_near_zero_recovers_signal() {
	let table = FlowMatchSchedule::default();
	let mut rng = StdRng::seed_from_u64(42);
	let x = Array4::from_elem((1, 2, 3, 3), 0.7_f32);
	let (noisy, _) = table.q_sample(&x.view(), 1, &mut rng).unwrap();
	for (a, b) in noisy.iter().zip(x.iter()) {
		assert!((a - b).abs() < 0.05, "q_sample at t=1 strayed too far from x0: {a} vs {b}");
	}
}

#[test]
fn q_sample_returns_the_drawn_noise() {
	let table = FlowMatchSchedule::default();
	let mut rng = StdRng::seed_from_u64(7);
	let x = Array4::<f32>::zeros((1, 1, 2, 2));
	let (noisy, eps) = table.q_sample(&x.view(), 1000, &mut rng).unwrap();
	// sigma(1000) == 1, alpha(1000) == 0: the noisy sample is the noise
	for (a, b) in noisy.iter().zip(eps.iter()) {
		assert!((a - b).abs() < 1e-6);
	}
}

#[test]
fn zlerp_at_zero_blend_is_identity() {
	let mut rng = StdRng::seed_from_u64(0);
	let x = Array4::from_elem((1, 2, 2, 2), 3.0_f32);
	let blended = zlerp(x.view(), 0.0, &mut rng);
	assert_eq!(blended, x);
}

#[test]
fn schedules_must_descend_to_zero() {
	assert!(StepSchedule::new(vec![1000, 750, 500, 250, 0]).is_ok());

	for bad in [vec![1000, 750], vec![250, 500, 0], vec![1000, 1000, 0], vec![0], vec![]] {
		let err = StepSchedule::new(bad).unwrap_err();
		assert!(matches!(err.downcast_ref::<RolloutError>(), Some(RolloutError::Config(_))));
	}
}

#[test]
fn default_schedule_is_the_distillation_schedule() {
	assert_eq!(StepSchedule::default().steps(), &[1000, 750, 500, 250, 0]);
	assert_eq!(StepSchedule::default().start(), 1000);
}

#[test]
fn selected_timestep_is_never_terminal() {
	let schedule = StepSchedule::default();
	let mut rng = StdRng::seed_from_u64(99);
	for _ in 0..200 {
		let t = schedule.draw_selected(&mut rng);
		assert!(t != 0);
		assert!(schedule.steps().contains(&t));
	}
}
