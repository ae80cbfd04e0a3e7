use crate::model::ModelDefinition;
use crate::simulator::resolver::ResolvedParameterSet;
use crate::PharmsimError;

/// Derivative function of a model under one resolved parameter set
///
/// Borrows everything it reads, so any number of systems can be evaluated
/// concurrently against one [ModelDefinition].
#[derive(Debug, Clone, Copy)]
pub struct OdeSystem<'a> {
    model: &'a ModelDefinition,
    params: &'a ResolvedParameterSet,
}

impl<'a> OdeSystem<'a> {
    pub fn new(model: &'a ModelDefinition, params: &'a ResolvedParameterSet) -> Self {
        OdeSystem { model, params }
    }

    pub fn nstates(&self) -> usize {
        self.model.nstates()
    }

    pub fn params(&self) -> &'a ResolvedParameterSet {
        self.params
    }

    /// Evaluate `dx/dt` at `(t, x)`; `rateiv` holds the infusion rate into each compartment
    #[inline]
    pub fn derivative(&self, t: f64, x: &[f64], rateiv: &[f64], dx: &mut [f64]) {
        let env = self.params.env(self.model, x, t);
        for (i, (ode, out)) in self.model.odes.iter().zip(dx.iter_mut()).enumerate() {
            *out = ode.eval(&env) + rateiv.get(i).copied().unwrap_or(0.0);
        }
    }

    /// Like [OdeSystem::derivative] but checks the slice lengths
    pub fn try_derivative(
        &self,
        t: f64,
        x: &[f64],
        rateiv: &[f64],
        dx: &mut [f64],
    ) -> Result<(), PharmsimError> {
        let lengths = [
            ("state", x.len()),
            ("infusion rates", rateiv.len()),
            ("derivative", dx.len()),
        ];
        for (what, actual) in lengths {
            if actual != self.nstates() {
                return Err(PharmsimError::InputMismatch {
                    what: what.to_string(),
                    expected: self.nstates(),
                    actual,
                });
            }
        }
        self.derivative(t, x, rateiv, dx);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::library;
    use crate::simulator::resolver::ParameterResolver;
    use approx::assert_relative_eq;

    #[test]
    fn peripheral_exchange_balances() {
        let model = library::mammillary(2).unwrap();
        let params = ParameterResolver::new(&model)
            .resolve(&model.population_values(), &[], &[0.0; 3], &[], None)
            .unwrap();
        let system = OdeSystem::new(&model, &params);
        let x = [10.0, 50.0, 20.0, 5.0];
        let mut dx = [0.0; 4];
        system.try_derivative(0.0, &x, &[0.0; 4], &mut dx).unwrap();

        // KA = 1, CL = 10, V = 50, Q = 5, VP = 100
        let cp = 50.0 / 50.0;
        assert_relative_eq!(dx[0], -10.0);
        assert_relative_eq!(dx[2], 5.0 * (cp - 20.0 / 100.0));
        assert_relative_eq!(dx[3], 5.0 * (cp - 5.0 / 100.0));
        // what leaves the depot and central compartment either reaches a
        // peripheral compartment or is eliminated
        let eliminated = 10.0 * cp;
        assert_relative_eq!(dx.iter().sum::<f64>(), -eliminated, epsilon = 1e-12);
    }

    #[test]
    fn infusion_rates_are_added() {
        let model = library::mammillary(0).unwrap();
        let params = ParameterResolver::new(&model)
            .resolve(&model.population_values(), &[], &[0.0; 3], &[], None)
            .unwrap();
        let system = OdeSystem::new(&model, &params);
        let mut dx = [0.0; 2];
        system.derivative(0.0, &[0.0, 0.0], &[0.0, 3.5], &mut dx);
        assert_eq!(dx, [0.0, 3.5]);

        let err = system
            .try_derivative(0.0, &[0.0], &[0.0, 0.0], &mut dx)
            .unwrap_err();
        assert!(matches!(err, PharmsimError::InputMismatch { actual: 1, .. }));
    }
}
