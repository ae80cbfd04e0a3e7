use approx::assert_relative_eq;
use pharmsim::prelude::simulator::{Integrator, OdeSystem, ParameterResolver, Schedule};
use pharmsim::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn han_individual(id: &str, pod: f64) -> Individual {
    Individual::builder(id)
        .covariate("POD", pod)
        .covariate("HCT", 30.0)
        .covariate("WT", 70.0)
        .covariate("CYP3A5", 1.0)
        .bolus(0.0, 5.0, 0)
        .repeat(1, 12.0)
        .observation(1.0)
        .observation(2.0)
        .observation(6.0)
        .observation(12.0)
        .observation(24.0)
        .build()
}

fn iov_individual() -> Individual {
    Individual::builder("tacrolimus")
        .covariate("LBW", 55.0)
        .covariate("CYP3A5", 2.0)
        .covariate("HCT", 31.0)
        .covariate("OCC", 1.0)
        .bolus(0.0, 4.0, 0)
        .observation(2.0)
        .observation(23.9)
        .record(24.0)
        .covariate("OCC", 2.0)
        .bolus(24.0, 4.0, 0)
        .observation(26.0)
        .observation(47.9)
        .build()
}

#[test]
fn han_clearance_at_transplant_day() {
    let model = library::han_2011().unwrap();
    let params = ParameterResolver::new(&model)
        .resolve(
            &model.population_values(),
            &[0.0, 30.0, 70.0, 1.0],
            &[0.0, 0.0],
            &[],
            None,
        )
        .unwrap();
    // POD 0 leaves only the categorical and hematocrit effects
    assert_relative_eq!(
        params.get("iCL").unwrap(),
        24.13 * 1.186 * 1.3458,
        max_relative = 1e-12
    );
    assert_relative_eq!(
        params.get("iV").unwrap(),
        716.0 * (0.355 * 70.0 / 59.025_f64).exp(),
        max_relative = 1e-12
    );
    assert_relative_eq!(params.get("iKA").unwrap(), 4.5, max_relative = 1e-12);
}

#[test]
fn sampling_is_reproducible_from_the_seed() {
    let model = library::han_2011().unwrap();
    let variance = library::han_2011_variance().unwrap();
    let simulator = Simulator::new(&model, &variance, SimulationConfig::default()).unwrap();
    let individual = han_individual("1", 3.0);

    let a = simulator
        .simulate(&individual, &mut StdRng::seed_from_u64(2011))
        .unwrap();
    let b = simulator
        .simulate(&individual, &mut StdRng::seed_from_u64(2011))
        .unwrap();
    let c = simulator
        .simulate(&individual, &mut StdRng::seed_from_u64(2012))
        .unwrap();

    assert_eq!(a, b);
    assert_ne!(a.effects(), c.effects());
    assert_eq!(a.series().len(), 5);
}

#[test]
fn zero_variance_runs_are_identical_and_noiseless() {
    let model = library::two_compartment_iov().unwrap();
    let variance = library::deterministic_variance(&model).unwrap();
    let simulator = Simulator::new(&model, &variance, SimulationConfig::default()).unwrap();
    let individual = iov_individual();

    let a = simulator
        .simulate(&individual, &mut StdRng::seed_from_u64(1))
        .unwrap();
    let b = simulator
        .simulate(&individual, &mut StdRng::seed_from_u64(99))
        .unwrap();

    assert_eq!(a.trajectory(), b.trajectory());
    assert_eq!(a.series(), b.series());
    assert_eq!(simulator.residual(), ResidualErrorModel::None);
    assert_eq!(a.series().observed("DV"), a.series().predicted("DV"));
}

#[test]
fn occasion_change_switches_between_occasion_effects() {
    let model = library::two_compartment_iov().unwrap();
    let variance = library::deterministic_variance(&model).unwrap();
    let simulator = Simulator::new(&model, &variance, SimulationConfig::default()).unwrap();
    let mut effects = RandomEffects::zeros(&model);
    effects.iov[0] = vec![0.3, -0.2];
    effects.iov[1] = vec![-0.1, 0.4];

    let simulation = simulator.predict(&iov_individual(), effects).unwrap();
    let series = simulation.series();
    let ika = series.predicted("iKA").unwrap();
    let iovcl = series.predicted("IOVCL").unwrap();

    assert_eq!(series.times(), vec![2.0, 23.9, 26.0, 47.9]);
    assert_relative_eq!(ika[0], 2.48 * 0.3_f64.exp(), max_relative = 1e-12);
    assert_relative_eq!(ika[1], ika[0]);
    assert_relative_eq!(ika[2], 2.48 * (-0.1_f64).exp(), max_relative = 1e-12);
    assert_eq!(iovcl[..2], [-0.2, -0.2]);
    assert_eq!(iovcl[2..], [0.4, 0.4]);
    assert_eq!(simulation.parameters()[0].occasion(), Some(0));
    assert_eq!(simulation.parameters()[1].occasion(), Some(1));
}

#[test]
fn unknown_occasion_is_rejected() {
    let strict = library::two_compartment_iov().unwrap();
    let variance = library::deterministic_variance(&strict).unwrap();
    let individual = Individual::builder("x")
        .covariate("LBW", 55.0)
        .covariate("CYP3A5", 2.0)
        .covariate("HCT", 31.0)
        .covariate("OCC", 9.0)
        .bolus(0.0, 4.0, 0)
        .observation(2.0)
        .build();

    let simulator = Simulator::new(&strict, &variance, SimulationConfig::default()).unwrap();
    let err = simulator
        .predict(&individual, RandomEffects::zeros(&strict))
        .unwrap_err();
    assert_eq!(err, PharmsimError::UnknownOccasion { value: 9.0 });
}

#[test]
fn mass_is_conserved_without_elimination() {
    let model = library::mammillary(2).unwrap();
    let variance = library::deterministic_variance(&model).unwrap();
    let mut population = model.population_values();
    population[model.parameter_index("CL").unwrap()] = 0.0;
    let simulator = Simulator::new(&model, &variance, SimulationConfig::default())
        .unwrap()
        .with_population(population)
        .unwrap();
    let individual = Individual::builder("closed")
        .bolus(0.0, 100.0, 0)
        .infusion(4.0, 50.0, 1, 2.0)
        .observation(1.0)
        .observation(5.0)
        .observation(12.0)
        .observation(48.0)
        .build();

    let simulation = simulator
        .predict(&individual, RandomEffects::zeros(&model))
        .unwrap();
    let totals: Vec<f64> = simulation
        .trajectory()
        .iter()
        .map(|snapshot| snapshot.state.iter().sum())
        .collect();

    assert_relative_eq!(totals[0], 100.0, max_relative = 1e-9);
    // halfway through the infusion
    assert_relative_eq!(totals[1], 125.0, max_relative = 1e-9);
    assert_relative_eq!(totals[2], 150.0, max_relative = 1e-9);
    assert_relative_eq!(totals[3], 150.0, max_relative = 1e-9);
}

#[test]
fn tighter_tolerance_agrees_within_the_error_budget() {
    let model = library::two_compartment_iov().unwrap();
    let variance = library::deterministic_variance(&model).unwrap();
    let loose = SolverOptions::default();
    let tight = loose.with_rtol(loose.rtol / 2.0).with_atol(loose.atol / 2.0);

    let run = |solver: SolverOptions| {
        let config = SimulationConfig::default().with_solver(solver);
        Simulator::new(&model, &variance, config)
            .unwrap()
            .predict(&iov_individual(), RandomEffects::zeros(&model))
            .unwrap()
    };
    let a = run(loose);
    let b = run(tight);

    let final_a = *a.series().predicted("CP").unwrap().last().unwrap();
    let final_b = *b.series().predicted("CP").unwrap().last().unwrap();
    assert!(final_a > 0.0);
    assert_relative_eq!(final_a, final_b, max_relative = loose.rtol);
}

#[test]
fn malformed_models_are_rejected_at_build() {
    let err = ModelDefinition::builder("typo")
        .compartment("CENT")
        .parameter("CL", 1.0)
        .parameter("V", 10.0)
        .ode("CENT", -var("CL") / var("VV") * var("CENT"))
        .build()
        .unwrap_err();
    assert!(matches!(
        err,
        PharmsimError::UndeclaredReference { ref name, .. } if name == "VV"
    ));
    assert!(err.is_construction_error());

    let err = ModelDefinition::builder("missing")
        .compartment("A")
        .compartment("B")
        .ode("A", -var("A"))
        .build()
        .unwrap_err();
    assert_eq!(err, PharmsimError::MissingDerivative("B".into()));
}

#[test]
fn failures_stay_with_their_individual() {
    let model = ModelDefinition::builder("explosive")
        .compartment("X")
        .parameter("K", 1.0)
        .ode("X", var("K") * var("X") * var("X"))
        .observed("OBS", var("X"))
        .build()
        .unwrap();
    let variance = VarianceComponents::default();
    let simulator = Simulator::new(&model, &variance, SimulationConfig::default()).unwrap();

    // x' = x^2 from x(0) = 1 blows up at t = 1
    let diverging = Individual::builder("diverging")
        .bolus(0.0, 1.0, 0)
        .observation(2.0)
        .build();
    let calm = Individual::builder("calm")
        .bolus(0.0, 0.5, 0)
        .observation(1.0)
        .build();
    let outcomes = simulator.simulate_population(&[diverging, calm], 0);

    assert!(matches!(
        outcomes[0].error(),
        Some(PharmsimError::IntegrationDiverged { time, .. }) if (*time - 1.0).abs() < 1e-3
    ));
    let calm = outcomes[1].simulation().unwrap();
    // x(t) = x0 / (1 - x0 t)
    assert_relative_eq!(calm.series().predicted("OBS").unwrap()[0], 1.0, max_relative = 1e-5);
}

#[test]
fn cancellation_stops_a_run() {
    let model = library::han_2011().unwrap();
    let variance = library::han_2011_variance().unwrap();
    let token = CancellationToken::new();
    let simulator = Simulator::new(&model, &variance, SimulationConfig::default())
        .unwrap()
        .with_cancellation(token.clone());
    let individual = han_individual("1", 3.0);

    assert!(simulator
        .simulate(&individual, &mut StdRng::seed_from_u64(3))
        .is_ok());
    token.cancel();
    let err = simulator
        .simulate(&individual, &mut StdRng::seed_from_u64(3))
        .unwrap_err();
    assert_eq!(err, PharmsimError::Cancelled { time: 0.0 });
}

#[test]
fn integrator_can_be_driven_directly() {
    let model = library::mammillary(0).unwrap();
    let params = ParameterResolver::new(&model)
        .resolve(&model.population_values(), &[], &[0.0; 3], &[], None)
        .unwrap();
    let schedule = Schedule::from(OdeSystem::new(&model, &params));
    let events = [
        Event::Bolus(Bolus::new(0.0, 100.0, 0)),
        Event::Observation(Observation::new(3.0)),
    ];
    let trajectory = Integrator::default()
        .run(&schedule, &[0.0, 0.0], &events, &[])
        .unwrap();

    // KA = 1, CL / V = 0.2
    let (ka, k) = (1.0_f64, 0.2_f64);
    let depot = 100.0 * (-ka * 3.0).exp();
    let central = 100.0 * ka / (ka - k) * ((-k * 3.0).exp() - (-ka * 3.0).exp());
    assert_relative_eq!(trajectory.snapshots()[0].state[0], depot, max_relative = 1e-5);
    assert_relative_eq!(trajectory.snapshots()[0].state[1], central, max_relative = 1e-5);
}
