//! Name resolution and reference closure checks for model definitions

use std::collections::{HashMap, HashSet};

use crate::model::definition::{
    Assignment, Capture, ModelBuilder, ModelDefinition, OccasionSpec,
};
use crate::model::expr::{Expr, Slot, Symbol};
use crate::PharmsimError;

/// What a name stands for at some point of the resolution pass
#[derive(Debug, Clone)]
enum Binding {
    Slot(Slot),
    /// Defines and table outputs are inlined where referenced
    Inline(Expr<Slot>),
}

/// Names visible to the expression being resolved
struct Scope {
    bindings: HashMap<String, Binding>,
    iiv_declared: bool,
    iov_declared: bool,
    time_visible: bool,
    iiv_used: usize,
    iov_used: usize,
}

impl Scope {
    fn bind(&mut self, name: &str, binding: Binding) {
        self.bindings.insert(name.to_string(), binding);
    }

    fn resolve(&mut self, expr: &Expr, context: &str) -> Result<Expr<Slot>, PharmsimError> {
        expr.try_map_refs(&mut |symbol: &Symbol| match symbol {
            Symbol::Name(name) => match self.bindings.get(name) {
                Some(Binding::Slot(slot)) => Ok(Expr::Ref(*slot)),
                Some(Binding::Inline(expr)) => Ok(expr.clone()),
                None => Err(PharmsimError::undeclared(name.clone(), context)),
            },
            Symbol::Iiv(index) => {
                if !self.iiv_declared {
                    return Err(PharmsimError::undeclared(format!("IIV[{}]", index), context));
                }
                self.iiv_used = self.iiv_used.max(index + 1);
                Ok(Expr::Ref(Slot::Iiv(*index)))
            }
            Symbol::Iov(index) => {
                if !self.iov_declared {
                    return Err(PharmsimError::undeclared(format!("IOV[{}]", index), context));
                }
                self.iov_used = self.iov_used.max(index + 1);
                Ok(Expr::Ref(Slot::Iov(*index)))
            }
            Symbol::Time if self.time_visible => Ok(Expr::Ref(Slot::Time)),
            Symbol::Time => Err(PharmsimError::undeclared("t", context)),
        })
    }
}

fn check_unique(builder: &ModelBuilder) -> Result<(), PharmsimError> {
    let mut seen = HashSet::new();
    let names = builder
        .parameters
        .iter()
        .map(|p| p.name.as_str())
        .chain(builder.covariates.iter().map(String::as_str))
        .chain(builder.compartments.iter().map(|c| c.name.as_str()))
        .chain(builder.main.iter().map(|(name, _)| name.as_str()))
        .chain(builder.defines.iter().map(|(name, _)| name.as_str()))
        .chain(builder.tables.iter().map(|(name, _, _)| name.as_str()));
    for name in names {
        if !seen.insert(name) {
            return Err(PharmsimError::DuplicateName(name.to_string()));
        }
    }
    Ok(())
}

fn occasion_spec(builder: &ModelBuilder) -> Result<Option<OccasionSpec>, PharmsimError> {
    let Some((matrix, covariate, occasions)) = &builder.iov else {
        return Ok(None);
    };
    let covariate = builder
        .covariates
        .iter()
        .position(|name| name == covariate)
        .ok_or_else(|| PharmsimError::undeclared(covariate.clone(), "occasion covariate"))?;
    for (i, value) in occasions.iter().enumerate() {
        if occasions[..i].contains(value) {
            return Err(PharmsimError::DuplicateName(format!("occasion {}", value)));
        }
    }
    Ok(Some(OccasionSpec {
        matrix: matrix.clone(),
        covariate,
        occasions: occasions.clone(),
        policy: builder.occasion_policy,
    }))
}

/// Resolve all model logic in a single ordered pass
///
/// `MAIN` statements see parameters, covariates, etas and earlier statements.
/// Defines, differential equations and tables additionally see compartments,
/// time, every statement, and earlier defines and tables.
pub(crate) fn resolve(builder: ModelBuilder) -> Result<ModelDefinition, PharmsimError> {
    check_unique(&builder)?;
    let iov = occasion_spec(&builder)?;

    let mut scope = Scope {
        bindings: HashMap::new(),
        iiv_declared: builder.iiv.is_some(),
        iov_declared: iov.is_some(),
        time_visible: false,
        iiv_used: 0,
        iov_used: 0,
    };
    for (i, parameter) in builder.parameters.iter().enumerate() {
        scope.bind(&parameter.name, Binding::Slot(Slot::Param(i)));
    }
    for (i, covariate) in builder.covariates.iter().enumerate() {
        scope.bind(covariate, Binding::Slot(Slot::Covariate(i)));
    }

    let mut main = Vec::with_capacity(builder.main.len());
    for (i, (name, expr)) in builder.main.iter().enumerate() {
        let expr = scope.resolve(expr, &format!("main({})", name))?;
        scope.bind(name, Binding::Slot(Slot::Local(i)));
        main.push(Assignment {
            name: name.clone(),
            expr,
        });
    }

    for (i, compartment) in builder.compartments.iter().enumerate() {
        scope.bind(&compartment.name, Binding::Slot(Slot::State(i)));
    }
    scope.time_visible = true;

    for (name, expr) in &builder.defines {
        let expr = scope.resolve(expr, &format!("define({})", name))?;
        scope.bind(name, Binding::Inline(expr));
    }

    let mut odes: Vec<Option<Expr<Slot>>> = vec![None; builder.compartments.len()];
    for (compartment, expr) in &builder.odes {
        let index = builder
            .compartments
            .iter()
            .position(|c| &c.name == compartment)
            .ok_or_else(|| PharmsimError::undeclared(compartment.clone(), "ode"))?;
        if odes[index].is_some() {
            return Err(PharmsimError::DuplicateName(format!("ode({})", compartment)));
        }
        odes[index] = Some(scope.resolve(expr, &format!("ode({})", compartment))?);
    }
    let odes = odes
        .into_iter()
        .zip(&builder.compartments)
        .map(|(ode, compartment)| {
            ode.ok_or_else(|| PharmsimError::MissingDerivative(compartment.name.clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut tables = Vec::with_capacity(builder.tables.len());
    for (name, expr, residual) in &builder.tables {
        let expr = scope.resolve(expr, &format!("table({})", name))?;
        scope.bind(name, Binding::Inline(expr.clone()));
        tables.push(Capture {
            name: name.clone(),
            expr,
            residual: *residual,
        });
    }

    let captures = if builder.captures.is_empty() {
        tables
    } else {
        let mut captures: Vec<Capture> = Vec::with_capacity(builder.captures.len());
        for name in &builder.captures {
            if captures.iter().any(|c| &c.name == name) {
                return Err(PharmsimError::DuplicateName(format!("capture({})", name)));
            }
            let residual = tables.iter().any(|t| &t.name == name && t.residual);
            let expr = scope.resolve(&crate::model::expr::var(name), "capture")?;
            captures.push(Capture {
                name: name.clone(),
                expr,
                residual,
            });
        }
        captures
    };

    Ok(ModelDefinition {
        name: builder.name,
        compartments: builder.compartments,
        parameters: builder.parameters,
        covariates: builder.covariates,
        main,
        odes,
        captures,
        iiv: builder.iiv,
        iov,
        residual: builder.residual,
        zero_power: builder.zero_power,
        iiv_used: scope.iiv_used,
        iov_used: scope.iov_used,
    })
}
