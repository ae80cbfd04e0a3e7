use pharmsim::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;

fn cohort(n: usize) -> Vec<Individual> {
    (0..n)
        .map(|i| {
            Individual::builder(format!("{}", i + 1))
                .covariate("LBW", 45.0 + i as f64)
                .covariate("CYP3A5", (i % 3 + 1) as f64)
                .covariate("HCT", 28.0 + 0.5 * i as f64)
                .covariate("OCC", 1.0)
                .bolus(0.0, 5.0, 0)
                .observation(1.0)
                .observation(4.0)
                .observation(11.9)
                .record(12.0)
                .covariate("OCC", 2.0)
                .bolus(12.0, 5.0, 0)
                .observation(13.0)
                .observation(23.9)
                .build()
        })
        .collect()
}

#[test]
fn parallel_runs_match_sequential_runs() {
    let model = library::two_compartment_iov().unwrap();
    let variance = library::two_compartment_iov_variance().unwrap();
    let simulator = Simulator::new(&model, &variance, SimulationConfig::default()).unwrap();
    let individuals = cohort(24);

    let sequential = simulator.simulate_population(&individuals, 500);
    let parallel: Vec<Simulation> = individuals
        .par_iter()
        .enumerate()
        .map(|(i, individual)| {
            let mut rng = StdRng::seed_from_u64(500 + i as u64);
            simulator.simulate(individual, &mut rng).unwrap()
        })
        .collect();

    assert_eq!(sequential.len(), parallel.len());
    for (outcome, simulation) in sequential.iter().zip(&parallel) {
        assert_eq!(outcome.id, simulation.id());
        assert_eq!(outcome.simulation(), Some(simulation));
    }
}

#[test]
fn shared_model_serves_many_threads() {
    let model = library::han_2011().unwrap();
    let variance = library::han_2011_variance().unwrap();
    let simulator = Simulator::new(&model, &variance, SimulationConfig::default()).unwrap();
    let individual = Individual::builder("shared")
        .covariate("POD", 5.0)
        .covariate("HCT", 35.0)
        .covariate("WT", 62.0)
        .covariate("CYP3A5", 2.0)
        .bolus(0.0, 3.0, 0)
        .observation(2.0)
        .observation(12.0)
        .build();

    let runs: Vec<Simulation> = (0..64u64)
        .into_par_iter()
        .map(|_| {
            simulator
                .simulate(&individual, &mut StdRng::seed_from_u64(64))
                .unwrap()
        })
        .collect();
    assert!(runs.windows(2).all(|pair| pair[0] == pair[1]));
}

#[test]
fn series_and_config_serialize() {
    let model = library::han_2011().unwrap();
    let variance = library::han_2011_variance().unwrap();
    let config = SimulationConfig::default()
        .with_dose_records(true)
        .with_output_times(vec![24.0]);
    let simulator = Simulator::new(&model, &variance, config.clone()).unwrap();
    let individual = Individual::builder("json")
        .covariate("POD", 1.0)
        .covariate("HCT", 30.0)
        .covariate("WT", 70.0)
        .covariate("CYP3A5", 3.0)
        .bolus(0.0, 5.0, 0)
        .observation(12.0)
        .build();
    let simulation = simulator
        .simulate(&individual, &mut StdRng::seed_from_u64(11))
        .unwrap();

    let json = serde_json::to_value(&simulation).unwrap();
    assert_eq!(json["id"], "json");
    assert_eq!(json["series"]["rows"].as_array().unwrap().len(), 3);
    assert_eq!(json["series"]["names"][4], "DV");

    let series: ObservationSeries =
        serde_json::from_value(json["series"].clone()).unwrap();
    assert_eq!(&series, simulation.series());

    let text = serde_json::to_string(&config).unwrap();
    let back: SimulationConfig = serde_json::from_str(&text).unwrap();
    assert_eq!(back, config);
}

#[test]
fn cancelled_population_reports_every_individual() {
    let model = library::two_compartment_iov().unwrap();
    let variance = library::two_compartment_iov_variance().unwrap();
    let token = CancellationToken::new();
    token.cancel();
    let simulator = Simulator::new(&model, &variance, SimulationConfig::default())
        .unwrap()
        .with_cancellation(token);

    let outcomes = simulator.simulate_population(&cohort(3), 0);
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes
        .iter()
        .all(|o| matches!(o.error(), Some(PharmsimError::Cancelled { .. }))));
}
