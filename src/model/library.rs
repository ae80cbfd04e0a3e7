//! Ready-made models together with the variance components they were published with.
//!
//! Every model follows the same layout: an extravascular depot that drains
//! first-order into the central compartment, a central compartment eliminated
//! by clearance, zero or more peripheral compartments, a `CP` define for the
//! central concentration and an observed `DV` carrying proportional and
//! additive residual error drawn from a matrix named `SIGMA`.
use crate::model::expr::*;
use crate::model::{ModelDefinition, OccasionPolicy};
use crate::variance::VarianceComponents;
use crate::PharmsimError;

/// One-compartment tacrolimus model with CYP3A5, hematocrit and
/// post-operative day effects on clearance
///
/// Covariates: `POD`, `HCT`, `WT`, `CYP3A5`. Genotypes outside 1, 2 and 3
/// leave clearance unchanged. With `POD = 0` the post-operative factor
/// `POD^-0.00762` follows the model's [ZeroPowerPolicy].
pub fn han_2011() -> Result<ModelDefinition, PharmsimError> {
    ModelDefinition::builder("han_2011")
        .compartment("EV")
        .compartment("CENT")
        .parameter("CL", 24.13)
        .parameter("V", 716.0)
        .parameter("KA", 4.5)
        .parameter("ETA1", 0.0)
        .parameter("ETA2", 0.0)
        .covariate("POD")
        .covariate("HCT")
        .covariate("WT")
        .covariate("CYP3A5")
        .iiv("IIV")
        .assign(
            "CL_EFFECT",
            categorical(var("CYP3A5"), &[(1.0, 1.186), (2.0, 1.13), (3.0, 1.0)], 1.0),
        )
        .assign("CL_HCT", threshold(var("HCT"), 33.0, 1.3458, 1.124))
        .assign("CL_POD", num(-0.00762))
        .assign(
            "iCL",
            var("CL")
                * (iiv(0) + var("ETA1")).exp()
                * var("POD").pow(var("CL_POD"))
                * var("CL_EFFECT")
                * var("CL_HCT"),
        )
        .assign(
            "iV",
            var("V") * (iiv(1) + var("ETA2")).exp() * (0.355 * var("WT") / 59.025).exp(),
        )
        .assign("iKA", var("KA"))
        .define("CP", var("CENT") / var("iV"))
        .ode("EV", -var("iKA") * var("EV"))
        .ode("CENT", var("iKA") * var("EV") - var("iCL") * var("CP"))
        .residual_error("SIGMA", Some(0), Some(1))
        .table("IPRED", var("CENT") / var("iV"))
        .observed("DV", var("IPRED"))
        .capture("CP")
        .capture("iCL")
        .capture("iV")
        .capture("iKA")
        .capture("DV")
        .build()
}

pub fn han_2011_variance() -> Result<VarianceComponents, PharmsimError> {
    VarianceComponents::builder()
        .diagonal("IIV", &[0.248, 0.237])
        .diagonal("SIGMA", &[0.0, 0.16])
        .build()
}

/// Two-compartment tacrolimus model with between-occasion variability on absorption and clearance
///
/// Covariates: `LBW`, `CYP3A5`, `HCT`, `OCC`. Six occasions (`OCC` 1 to 6)
/// each get their own draw from the two-dimensional `IOV` matrix, ordered
/// (KA, CL), plus a fixed per-occasion offset parameter (`ETA5`..`ETA10` on
/// KA, `ETA11`..`ETA16` on CL).
pub fn two_compartment_iov() -> Result<ModelDefinition, PharmsimError> {
    let occasions = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
    let offsets = |first: usize| -> Vec<(f64, Expr)> {
        occasions
            .iter()
            .enumerate()
            .map(|(i, &occ)| (occ, var(&format!("ETA{}", first + i))))
            .collect()
    };
    let lbw = || var("LBW") / 60.0;

    let mut builder = ModelDefinition::builder("two_compartment_iov")
        .compartment("EV")
        .compartment("CENT")
        .compartment("PERIPH")
        .parameter("CL", 21.0)
        .parameter("V2", 330.0)
        .parameter("Q", 35.44)
        .parameter("V3", 118.0)
        .parameter("KA", 2.48);
    for i in 1..=16 {
        builder = builder.parameter(&format!("ETA{}", i), 0.0);
    }
    builder
        .covariate("LBW")
        .covariate("CYP3A5")
        .covariate("HCT")
        .covariate("OCC")
        .iiv("IIV")
        .iov("IOV", "OCC", &occasions)
        .occasion_policy(OccasionPolicy::Strict)
        .assign("IOVKA", iov(0) + select(var("OCC"), offsets(5), 0.0))
        .assign("IOVCL", iov(1) + select(var("OCC"), offsets(11), 0.0))
        .assign(
            "CL_EFFECT",
            categorical(var("CYP3A5"), &[(1.0, 2.0), (2.0, 1.8), (3.0, 1.0)], 1.0),
        )
        .assign("V_LBW", num(1.0))
        .assign("CL_LBW", num(0.75))
        .assign("CL_HCT", num(-1.0))
        .assign(
            "iCL",
            var("CL")
                * var("CL_EFFECT")
                * (var("HCT") / 33.5).pow(var("CL_HCT"))
                * lbw().pow(var("CL_LBW"))
                * (iiv(0) + var("ETA1") + var("IOVCL")).exp(),
        )
        .assign(
            "iV2",
            var("V2") * lbw().pow(var("V_LBW")) * (iiv(1) + var("ETA2")).exp(),
        )
        .assign(
            "iQ",
            var("Q") * (iiv(2) + var("ETA3")).exp() * lbw().pow(var("CL_LBW")),
        )
        .assign(
            "iV3",
            var("V3") * (iiv(3) + var("ETA4")).exp() * lbw().pow(var("V_LBW")),
        )
        .assign("iKA", var("KA") * var("IOVKA").exp())
        .define("CP", var("CENT") / var("iV2"))
        .define("CT", var("PERIPH") / var("iV3"))
        .ode("EV", -var("iKA") * var("EV"))
        .ode(
            "CENT",
            var("iKA") * var("EV") - var("iCL") * var("CP") - var("iQ") * var("CP")
                + var("iQ") * var("CT"),
        )
        .ode("PERIPH", var("iQ") * var("CP") - var("iQ") * var("CT"))
        .residual_error("SIGMA", Some(0), Some(1))
        .table("IPRED", var("CENT") / var("iV2"))
        .observed("DV", var("IPRED"))
        .capture("CP")
        .capture("CT")
        .capture("iCL")
        .capture("iV2")
        .capture("iKA")
        .capture("iQ")
        .capture("iV3")
        .capture("IOVKA")
        .capture("IOVCL")
        .capture("OCC")
        .capture("DV")
        .build()
}

pub fn two_compartment_iov_variance() -> Result<VarianceComponents, PharmsimError> {
    VarianceComponents::builder()
        .diagonal("IIV", &[0.1296, 1.41, 0.3364, 0.6724])
        .diagonal("IOV", &[0.7396, 0.0676])
        .diagonal("SIGMA", &[0.0, 0.04])
        .build()
}

/// First-order absorption into a central compartment that exchanges with
/// `peripherals` peripheral compartments
///
/// Compartments are `DEPOT`, `CENT`, then `P1`..`Pn`. Parameters are `CL`,
/// `V`, `KA` and a `Q{i}`/`VP{i}` pair per peripheral; `IIV` scales
/// (CL, V, KA) log-normally. No covariates.
pub fn mammillary(peripherals: usize) -> Result<ModelDefinition, PharmsimError> {
    let mut builder = ModelDefinition::builder(&format!("mammillary_{}", peripherals))
        .compartment("DEPOT")
        .compartment("CENT");
    for i in 1..=peripherals {
        builder = builder.compartment(&format!("P{}", i));
    }
    builder = builder
        .parameter("CL", 10.0)
        .parameter("V", 50.0)
        .parameter("KA", 1.0);
    for i in 1..=peripherals {
        builder = builder
            .parameter(&format!("Q{}", i), 5.0)
            .parameter(&format!("VP{}", i), 100.0);
    }
    builder = builder
        .iiv("IIV")
        .assign("iCL", var("CL") * iiv(0).exp())
        .assign("iV", var("V") * iiv(1).exp())
        .assign("iKA", var("KA") * iiv(2).exp())
        .define("CP", var("CENT") / var("iV"));

    // net flow from the central compartment into peripheral i
    let flow = |i: usize| {
        var(&format!("Q{}", i)) * (var("CP") - var(&format!("P{}", i)) / var(&format!("VP{}", i)))
    };
    let mut central = var("iKA") * var("DEPOT") - var("iCL") * var("CP");
    for i in 1..=peripherals {
        central = central - flow(i);
        builder = builder.ode(&format!("P{}", i), flow(i));
    }
    builder
        .ode("DEPOT", -var("iKA") * var("DEPOT"))
        .ode("CENT", central)
        .residual_error("SIGMA", Some(0), Some(1))
        .observed("DV", var("CP"))
        .build()
}

/// All-zero matrices of the sizes `model` reads, for deterministic runs
pub fn deterministic_variance(
    model: &ModelDefinition,
) -> Result<VarianceComponents, PharmsimError> {
    let mut builder = VarianceComponents::builder();
    if let Some(name) = model.iiv_matrix() {
        builder = builder.diagonal(name, &vec![0.0; model.iiv_dimension()]);
    }
    if let Some(spec) = model.occasions() {
        builder = builder.diagonal(&spec.matrix, &vec![0.0; model.iov_dimension()]);
    }
    if let Some(residual) = model.residual() {
        let dim = residual
            .additive
            .into_iter()
            .chain(residual.proportional)
            .map(|i| i + 1)
            .max()
            .unwrap_or(0);
        builder = builder.diagonal(&residual.matrix, &vec![0.0; dim]);
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_models_build() {
        let han = han_2011().unwrap();
        assert_eq!(han.nstates(), 2);
        assert_eq!(han.iiv_dimension(), 2);
        assert_eq!(han.captures().len(), 5);
        han_2011_variance().unwrap();

        let iov = two_compartment_iov().unwrap();
        assert_eq!(iov.nstates(), 3);
        assert_eq!(iov.iiv_dimension(), 4);
        assert_eq!(iov.iov_dimension(), 2);
        assert_eq!(iov.occasions().unwrap().occasions.len(), 6);
        two_compartment_iov_variance().unwrap();
    }

    #[test]
    fn mammillary_scales_with_peripherals() {
        for n in 0..4 {
            let model = mammillary(n).unwrap();
            assert_eq!(model.nstates(), 2 + n);
            assert_eq!(model.parameters().len(), 3 + 2 * n);
            assert_eq!(model.compartment_index("CENT"), Some(1));
        }
    }

    #[test]
    fn deterministic_variance_matches_model_dimensions() {
        let model = two_compartment_iov().unwrap();
        let variance = deterministic_variance(&model).unwrap();
        assert_eq!(variance.get("IIV").unwrap().dim(), 4);
        assert_eq!(variance.get("IOV").unwrap().dim(), 2);
        assert_eq!(variance.get("SIGMA").unwrap().dim(), 2);
    }
}
