//! Simulates a small tacrolimus cohort with the two-compartment model and
//! between-occasion variability, printing one line per output row.
//!
//! Each subject gets a twice-daily oral dose for two days. The occasion
//! covariate changes on day two, so absorption and clearance are redrawn.

use pharmsim::*;

fn subject(id: usize) -> Individual {
    Individual::builder(format!("{}", id))
        .covariate("LBW", 48.0 + 4.0 * id as f64)
        .covariate("CYP3A5", (id % 3 + 1) as f64)
        .covariate("HCT", 29.0 + id as f64)
        .covariate("OCC", 1.0)
        .bolus(0.0, 4.0, 0)
        .repeat(1, 12.0)
        .observation(11.9)
        .observation(23.9)
        .record(24.0)
        .covariate("OCC", 2.0)
        .bolus(24.0, 4.0, 0)
        .repeat(1, 12.0)
        .observation(35.9)
        .observation(47.9)
        .build()
}

fn main() -> anyhow::Result<()> {
    let model = library::two_compartment_iov()?;
    let variance = library::two_compartment_iov_variance()?;
    let config = SimulationConfig::default()
        .with_dose_records(true)
        .with_output_times((1..=8).map(|h| h as f64 * 0.5).collect());
    let simulator = Simulator::new(&model, &variance, config)?;

    let cohort: Vec<Individual> = (1..=4).map(subject).collect();
    let outcomes = simulator.simulate_population(&cohort, 20_240_501);

    println!("ID\tTIME\tEVID\tOCC\tIPRED\tDV");
    for outcome in &outcomes {
        let simulation = match &outcome.result {
            Ok(simulation) => simulation,
            Err(err) => {
                eprintln!("{}: {}", outcome.id, err);
                continue;
            }
        };
        let series = simulation.series();
        let missing = |name: &str| anyhow::anyhow!("capture {} not reported", name);
        let occ = series.predicted("OCC").ok_or_else(|| missing("OCC"))?;
        let cp = series.predicted("CP").ok_or_else(|| missing("CP"))?;
        let dv = series.observed("DV").ok_or_else(|| missing("DV"))?;
        for (i, row) in series.rows().iter().enumerate() {
            println!(
                "{}\t{:.1}\t{}\t{}\t{:.4}\t{:.4}",
                outcome.id, row.time, row.evid, occ[i], cp[i], dv[i]
            );
        }
    }
    Ok(())
}
