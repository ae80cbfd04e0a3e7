use serde::Serialize;

use crate::model::expr::Env;
use crate::model::{ModelDefinition, OccasionPolicy};
use crate::variance::RandomEffectVector;
use crate::PharmsimError;

/// Structural parameters of one individual for one record
///
/// Holds every input the model logic was evaluated against together with the
/// resulting `MAIN` values, so the differential equations and captures can be
/// evaluated later without resolving anything again.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedParameterSet {
    names: Vec<String>,
    values: Vec<f64>,
    population: Vec<f64>,
    covariates: Vec<f64>,
    iiv: Vec<f64>,
    iov: Vec<f64>,
    occasion: Option<usize>,
}

impl ResolvedParameterSet {
    /// Value of a `MAIN` statement by name
    pub fn get(&self, name: &str) -> Option<f64> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| self.values[i])
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// `MAIN` values in evaluation order
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.names
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().copied())
    }

    /// Slot of the occasion that supplied the between-occasion etas
    pub fn occasion(&self) -> Option<usize> {
        self.occasion
    }

    /// The between-occasion etas in effect for this record
    pub fn iov(&self) -> &[f64] {
        &self.iov
    }

    pub(crate) fn env<'a>(
        &'a self,
        model: &ModelDefinition,
        state: &'a [f64],
        time: f64,
    ) -> Env<'a> {
        Env {
            params: &self.population,
            covariates: &self.covariates,
            iiv: &self.iiv,
            iov: &self.iov,
            locals: &self.values,
            state,
            time,
            zero_power: model.zero_power(),
        }
    }
}

/// Evaluates a model's `MAIN` statements for individual records
#[derive(Debug, Clone, Copy)]
pub struct ParameterResolver<'a> {
    model: &'a ModelDefinition,
}

impl<'a> ParameterResolver<'a> {
    pub fn new(model: &'a ModelDefinition) -> Self {
        ParameterResolver { model }
    }

    /// Resolve the structural parameters for one record
    ///
    /// `population` and `covariates` are in declaration order, `iov` holds one
    /// vector per declared occasion and `occasion` is the record's occasion
    /// value, if the model declares occasions. Statements are evaluated in
    /// order, each seeing the ones before it. Non-finite inputs propagate.
    pub fn resolve(
        &self,
        population: &[f64],
        covariates: &[f64],
        iiv: &[f64],
        iov: &[RandomEffectVector],
        occasion: Option<f64>,
    ) -> Result<ResolvedParameterSet, PharmsimError> {
        let model = self.model;
        check_len("population parameters", model.parameters().len(), population.len())?;
        check_len("covariates", model.covariates().len(), covariates.len())?;

        let (slot, iov) = match (model.occasions(), occasion) {
            (None, _) => (None, Vec::new()),
            (Some(spec), value) => {
                let value = value.unwrap_or(f64::NAN);
                match spec.slot(value) {
                    Some(slot) => {
                        let etas = iov.get(slot).ok_or_else(|| PharmsimError::InputMismatch {
                            what: "occasion effects".to_string(),
                            expected: spec.occasions.len(),
                            actual: iov.len(),
                        })?;
                        (Some(slot), etas.clone())
                    }
                    None => match spec.policy {
                        OccasionPolicy::Strict => {
                            return Err(PharmsimError::UnknownOccasion { value })
                        }
                        OccasionPolicy::ZeroEffect => {
                            tracing::warn!(
                                model = model.name(),
                                occasion = value,
                                "unknown occasion, using zero between-occasion effects"
                            );
                            (None, vec![0.0; model.iov_dimension()])
                        }
                    },
                }
            }
        };

        let mut resolved = ResolvedParameterSet {
            names: Vec::with_capacity(model.assignments().len()),
            values: Vec::with_capacity(model.assignments().len()),
            population: population.to_vec(),
            covariates: covariates.to_vec(),
            iiv: iiv.to_vec(),
            iov,
            occasion: slot,
        };
        for assignment in model.assignments() {
            let value = assignment.expr.eval(&resolved.env(model, &[], f64::NAN));
            resolved.names.push(assignment.name.clone());
            resolved.values.push(value);
        }
        Ok(resolved)
    }
}

fn check_len(what: &str, expected: usize, actual: usize) -> Result<(), PharmsimError> {
    if expected != actual {
        return Err(PharmsimError::InputMismatch {
            what: what.to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::expr::*;
    use crate::model::library;
    use approx::assert_relative_eq;

    #[test]
    fn han_clearance_at_zero_post_operative_day() {
        let model = library::han_2011().unwrap();
        let resolver = ParameterResolver::new(&model);
        // POD, HCT, WT, CYP3A5
        let params = resolver
            .resolve(&model.population_values(), &[0.0, 30.0, 70.0, 3.0], &[0.0, 0.0], &[], None)
            .unwrap();
        assert_relative_eq!(params.get("iCL").unwrap(), 24.13 * 1.3458, max_relative = 1e-12);
        assert_relative_eq!(
            params.get("iV").unwrap(),
            716.0 * (0.355_f64 * 70.0 / 59.025).exp(),
            max_relative = 1e-12
        );
        assert_eq!(params.get("iKA"), Some(4.5));
    }

    #[test]
    fn zero_power_can_propagate() {
        let model = ModelDefinition::builder("pod")
            .compartment("CENT")
            .parameter("CL", 2.0)
            .covariate("POD")
            .zero_power(ZeroPowerPolicy::Propagate)
            .assign("iCL", var("CL") * var("POD").pow(-0.5))
            .ode("CENT", num(0.0))
            .build()
            .unwrap();
        let params = ParameterResolver::new(&model)
            .resolve(&[2.0], &[0.0], &[], &[], None)
            .unwrap();
        assert_eq!(params.get("iCL"), Some(f64::INFINITY));
    }

    #[test]
    fn occasion_selects_its_eta_pair() {
        let model = library::two_compartment_iov().unwrap();
        let resolver = ParameterResolver::new(&model);
        let iov: Vec<Vec<f64>> = (0..6).map(|i| vec![0.1 * i as f64, -0.05 * i as f64]).collect();
        let iiv = [0.1, 0.2, 0.3, 0.4];
        // LBW, CYP3A5, HCT, OCC
        let first = resolver
            .resolve(&model.population_values(), &[60.0, 3.0, 33.5, 2.0], &iiv, &iov, Some(2.0))
            .unwrap();
        let second = resolver
            .resolve(&model.population_values(), &[60.0, 3.0, 33.5, 5.0], &iiv, &iov, Some(5.0))
            .unwrap();

        assert_eq!(first.occasion(), Some(1));
        assert_eq!(second.occasion(), Some(4));
        assert_relative_eq!(first.get("IOVKA").unwrap(), 0.1);
        assert_relative_eq!(second.get("IOVCL").unwrap(), -0.2);
        assert_ne!(first.get("iKA"), second.get("iKA"));
        assert_ne!(first.get("iCL"), second.get("iCL"));
        for name in ["iV2", "iQ", "iV3"] {
            assert_eq!(first.get(name), second.get(name));
        }
    }

    #[test]
    fn unknown_occasion_follows_policy() {
        let model = library::two_compartment_iov().unwrap();
        let iov = vec![vec![0.3, 0.3]; 6];
        let covariates = [60.0, 3.0, 33.5, 9.0];
        let err = ParameterResolver::new(&model)
            .resolve(&model.population_values(), &covariates, &[0.0; 4], &iov, Some(9.0))
            .unwrap_err();
        assert_eq!(err, PharmsimError::UnknownOccasion { value: 9.0 });

        let mut permissive = model.clone();
        if let Some(spec) = permissive.iov.as_mut() {
            spec.policy = OccasionPolicy::ZeroEffect;
        }
        let params = ParameterResolver::new(&permissive)
            .resolve(&model.population_values(), &covariates, &[0.0; 4], &iov, Some(9.0))
            .unwrap();
        assert_eq!(params.occasion(), None);
        assert_eq!(params.get("IOVKA"), Some(0.0));
        assert_eq!(params.get("iKA"), Some(2.48));
    }

    #[test]
    fn non_finite_inputs_propagate() {
        let model = library::han_2011().unwrap();
        let params = ParameterResolver::new(&model)
            .resolve(
                &model.population_values(),
                &[1.0, f64::NAN, 70.0, 3.0],
                &[0.0, 0.0],
                &[],
                None,
            )
            .unwrap();
        assert!(params.get("CL_HCT").unwrap().is_nan());
        assert!(params.get("iCL").unwrap().is_nan());
        assert!(params.get("iV").unwrap().is_finite());
    }

    #[test]
    fn wrong_lengths_are_rejected() {
        let model = library::han_2011().unwrap();
        let err = ParameterResolver::new(&model)
            .resolve(&[1.0], &[0.0, 30.0, 70.0, 3.0], &[], &[], None)
            .unwrap_err();
        assert!(matches!(err, PharmsimError::InputMismatch { expected: 5, actual: 1, .. }));
    }
}
