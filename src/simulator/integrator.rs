//! Event-driven adaptive integration.
//!
//! The [Integrator] walks a sorted list of stops (parameter switches, infusion
//! ends, doses, observations and grid times) and integrates the active
//! [OdeSystem] between consecutive stops with an embedded Dormand–Prince
//! 5(4) pair. Every discontinuity is a stop, so no step ever straddles one.
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::data::Event;
use crate::simulator::system::OdeSystem;
use crate::PharmsimError;

/// Error tolerances and step size limits of the integrator
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolverOptions {
    /// Relative tolerance
    pub rtol: f64,
    /// Absolute tolerance, in amount units
    pub atol: f64,
    /// Initial step; `0.0` picks one from the interval length
    pub h0: f64,
    /// Smallest step the integrator may take before giving up
    pub h_min: f64,
    pub h_max: f64,
    /// Step budget for each interval between two stops
    pub max_steps: usize,
}

impl Default for SolverOptions {
    fn default() -> Self {
        SolverOptions {
            rtol: 1e-6,
            atol: 1e-9,
            h0: 0.0,
            h_min: 1e-12,
            h_max: f64::MAX,
            max_steps: 100_000,
        }
    }
}

impl SolverOptions {
    pub fn with_rtol(mut self, rtol: f64) -> Self {
        self.rtol = rtol;
        self
    }

    pub fn with_atol(mut self, atol: f64) -> Self {
        self.atol = atol;
        self
    }

    pub fn with_h0(mut self, h0: f64) -> Self {
        self.h0 = h0;
        self
    }

    pub fn with_h_min(mut self, h_min: f64) -> Self {
        self.h_min = h_min;
        self
    }

    pub fn with_h_max(mut self, h_max: f64) -> Self {
        self.h_max = h_max;
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn validate(&self) -> Result<(), PharmsimError> {
        let positive = |name: &str, value: f64| {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                Err(PharmsimError::InvalidOptions(format!(
                    "{} must be finite and > 0, got {}",
                    name, value
                )))
            }
        };
        positive("rtol", self.rtol)?;
        positive("atol", self.atol)?;
        positive("h_min", self.h_min)?;
        positive("h_max", self.h_max)?;
        if !self.h0.is_finite() || self.h0 < 0.0 {
            return Err(PharmsimError::InvalidOptions(format!(
                "h0 must be finite and >= 0, got {}",
                self.h0
            )));
        }
        if self.h_max < self.h_min {
            return Err(PharmsimError::InvalidOptions(
                "h_max must not be smaller than h_min".to_string(),
            ));
        }
        if self.max_steps == 0 {
            return Err(PharmsimError::InvalidOptions(
                "max_steps must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    fn initial_step(&self, span: f64) -> f64 {
        if self.h0 > 0.0 {
            self.h0.min(self.h_max).min(span)
        } else {
            (span * 1e-3).max(self.h_min).min(self.h_max).min(span)
        }
    }
}

/// Cooperative cancellation flag, checked by the integrator at every event boundary
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// The derivative functions in effect over time
///
/// Segment `i` is active from its start time until the start of segment
/// `i + 1`; the first segment's start is where integration begins.
#[derive(Debug, Clone)]
pub struct Schedule<'a> {
    segments: Vec<(f64, OdeSystem<'a>)>,
}

impl<'a> Schedule<'a> {
    pub fn new(start: f64, system: OdeSystem<'a>) -> Self {
        Schedule {
            segments: vec![(start, system)],
        }
    }

    /// Switch to `system` at time `from`
    pub fn then(mut self, from: f64, system: OdeSystem<'a>) -> Self {
        self.segments.push((from, system));
        self
    }

    pub fn start(&self) -> f64 {
        self.segments[0].0
    }

    fn len(&self) -> usize {
        self.segments.len()
    }

    fn nstates(&self) -> usize {
        self.segments[0].1.nstates()
    }

    fn validate(&self) -> Result<(), PharmsimError> {
        for (i, (from, system)) in self.segments.iter().enumerate() {
            if !from.is_finite() || (i > 0 && *from < self.segments[i - 1].0) {
                return Err(PharmsimError::InvalidEvent {
                    time: *from,
                    reason: "parameter segments must start at finite, non-decreasing times"
                        .to_string(),
                });
            }
            if system.nstates() != self.nstates() {
                return Err(PharmsimError::InputMismatch {
                    what: "segment state".to_string(),
                    expected: self.nstates(),
                    actual: system.nstates(),
                });
            }
        }
        Ok(())
    }
}

impl<'a> From<OdeSystem<'a>> for Schedule<'a> {
    fn from(system: OdeSystem<'a>) -> Self {
        Schedule::new(0.0, system)
    }
}

/// Why a snapshot was taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotKind {
    Observation,
    /// State right after a dose was applied
    Dose,
    /// A requested output time
    Grid,
}

impl SnapshotKind {
    pub fn evid(&self) -> u8 {
        match self {
            SnapshotKind::Dose => 1,
            SnapshotKind::Observation | SnapshotKind::Grid => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub time: f64,
    /// Compartment amounts
    pub state: Vec<f64>,
    /// Parameter segment in effect at `time`
    pub segment: usize,
    pub kind: SnapshotKind,
}

/// Time-ordered compartment snapshots of one run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    snapshots: Vec<Snapshot>,
}

impl Trajectory {
    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Snapshot> {
        self.snapshots.iter()
    }

    pub fn times(&self) -> Vec<f64> {
        self.snapshots.iter().map(|s| s.time).collect()
    }

    fn push(&mut self, snapshot: Snapshot) {
        self.snapshots.push(snapshot);
    }
}

#[derive(Debug, Clone, Copy)]
enum Action {
    Switch(usize),
    StopInfusion { input: usize, rate: f64 },
    Dose(usize),
    Observe,
    Grid,
}

impl Action {
    fn priority(&self) -> u8 {
        match self {
            Action::Switch(_) => 0,
            Action::StopInfusion { .. } => 1,
            Action::Dose(_) => 2,
            Action::Observe | Action::Grid => 3,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Stop {
    time: f64,
    action: Action,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Advancing,
    AtEvent,
    Complete,
}

/// Stage buffers reused across steps
struct Workspace {
    k: [Vec<f64>; 7],
    y_tmp: Vec<f64>,
    y_new: Vec<f64>,
}

impl Workspace {
    fn new(n: usize) -> Self {
        Workspace {
            k: std::array::from_fn(|_| vec![0.0; n]),
            y_tmp: vec![0.0; n],
            y_new: vec![0.0; n],
        }
    }
}

// Dormand–Prince coefficients
const C: [f64; 6] = [1.0 / 5.0, 3.0 / 10.0, 4.0 / 5.0, 8.0 / 9.0, 1.0, 1.0];
const A: [&[f64]; 6] = [
    &[1.0 / 5.0],
    &[3.0 / 40.0, 9.0 / 40.0],
    &[44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0],
    &[19372.0 / 6561.0, -25360.0 / 2187.0, 64448.0 / 6561.0, -212.0 / 729.0],
    &[
        9017.0 / 3168.0,
        -355.0 / 33.0,
        46732.0 / 5247.0,
        49.0 / 176.0,
        -5103.0 / 18656.0,
    ],
    // fifth-order weights, the advancing solution
    &[
        35.0 / 384.0,
        0.0,
        500.0 / 1113.0,
        125.0 / 192.0,
        -2187.0 / 6784.0,
        11.0 / 84.0,
    ],
];
// fifth-order minus fourth-order weights
const E: [f64; 7] = [
    35.0 / 384.0 - 5179.0 / 57600.0,
    0.0,
    500.0 / 1113.0 - 7571.0 / 16695.0,
    125.0 / 192.0 - 393.0 / 640.0,
    -2187.0 / 6784.0 + 92097.0 / 339200.0,
    11.0 / 84.0 - 187.0 / 2100.0,
    -1.0 / 40.0,
];

/// Adaptive explicit integrator for [Schedule]s of [OdeSystem]s
#[derive(Debug, Clone, Default)]
pub struct Integrator {
    options: SolverOptions,
    record_doses: bool,
    cancellation: Option<CancellationToken>,
}

impl Integrator {
    pub fn new(options: SolverOptions) -> Self {
        Integrator {
            options,
            ..Default::default()
        }
    }

    /// Also snapshot the state right after every dose
    pub fn with_dose_records(mut self, record_doses: bool) -> Self {
        self.record_doses = record_doses;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn options(&self) -> &SolverOptions {
        &self.options
    }

    /// Integrate from the schedule's start through the last event or output time
    ///
    /// At equal times parameter switches come first, then infusion ends, then
    /// doses, then snapshots. Bolus doses are added to the state, infusions
    /// add their rate to the derivative until they end, observations and
    /// `output_times` only take snapshots.
    pub fn run(
        &self,
        schedule: &Schedule,
        initial: &[f64],
        events: &[Event],
        output_times: &[f64],
    ) -> Result<Trajectory, PharmsimError> {
        self.options.validate()?;
        schedule.validate()?;
        let n = schedule.nstates();
        if initial.len() != n {
            return Err(PharmsimError::InputMismatch {
                what: "initial state".to_string(),
                expected: n,
                actual: initial.len(),
            });
        }
        let stops = self.stops(schedule, events, output_times)?;

        let mut t = schedule.start();
        let mut x = initial.to_vec();
        check_finite(&x, t)?;
        let mut rates = vec![0.0; n];
        let mut segment = 0;
        let mut trajectory = Trajectory::default();
        let mut workspace = Workspace::new(n);
        let mut next = 0;
        let mut phase = Phase::Idle;

        while phase != Phase::Complete {
            phase = match phase {
                Phase::Idle => {
                    tracing::trace!(start = t, stops = stops.len(), "integration started");
                    Phase::Advancing
                }
                Phase::Advancing => match stops.get(next) {
                    None => Phase::Complete,
                    Some(stop) => {
                        if stop.time > t {
                            let system = &schedule.segments[segment].1;
                            self.advance(system, &mut x, &rates, t, stop.time, &mut workspace)?;
                            t = stop.time;
                        }
                        Phase::AtEvent
                    }
                },
                Phase::AtEvent => {
                    self.check_cancelled(t)?;
                    while let Some(stop) = stops.get(next).filter(|stop| stop.time <= t) {
                        let kind = match stop.action {
                            Action::Switch(index) => {
                                segment = index;
                                None
                            }
                            Action::StopInfusion { input, rate } => {
                                rates[input] -= rate;
                                None
                            }
                            Action::Dose(index) => {
                                match &events[index] {
                                    Event::Bolus(bolus) => x[bolus.input()] += bolus.amount(),
                                    Event::Infusion(infusion) => {
                                        rates[infusion.input()] += infusion.rate()
                                    }
                                    Event::Observation(_) => {}
                                }
                                tracing::trace!(time = t, event = %events[index], "dose applied");
                                check_finite(&x, t)?;
                                self.record_doses.then_some(SnapshotKind::Dose)
                            }
                            Action::Observe => Some(SnapshotKind::Observation),
                            Action::Grid => Some(SnapshotKind::Grid),
                        };
                        if let Some(kind) = kind {
                            trajectory.push(Snapshot {
                                time: t,
                                state: x.clone(),
                                segment,
                                kind,
                            });
                        }
                        next += 1;
                    }
                    Phase::Advancing
                }
                Phase::Complete => Phase::Complete,
            };
        }
        Ok(trajectory)
    }

    fn check_cancelled(&self, time: f64) -> Result<(), PharmsimError> {
        match &self.cancellation {
            Some(token) if token.is_cancelled() => Err(PharmsimError::Cancelled { time }),
            _ => Ok(()),
        }
    }

    fn stops(
        &self,
        schedule: &Schedule,
        events: &[Event],
        output_times: &[f64],
    ) -> Result<Vec<Stop>, PharmsimError> {
        let start = schedule.start();
        let n = schedule.nstates();
        let invalid = |time: f64, reason: &str| PharmsimError::InvalidEvent {
            time,
            reason: reason.to_string(),
        };

        let mut stops = Vec::with_capacity(schedule.len() + 2 * events.len() + output_times.len());
        for (i, (from, _)) in schedule.segments.iter().enumerate().skip(1) {
            stops.push(Stop {
                time: *from,
                action: Action::Switch(i),
            });
        }
        for (index, event) in events.iter().enumerate() {
            let time = event.time();
            if !time.is_finite() || time < start {
                return Err(invalid(time, "event time is before the start or not finite"));
            }
            if let Some(input) = event.input() {
                if input >= n {
                    return Err(invalid(time, "dose targets an unknown compartment"));
                }
            }
            match event {
                Event::Bolus(bolus) => {
                    if !bolus.amount().is_finite() {
                        return Err(invalid(time, "bolus amount is not finite"));
                    }
                    stops.push(Stop {
                        time,
                        action: Action::Dose(index),
                    });
                }
                Event::Infusion(infusion) => {
                    if !infusion.amount().is_finite()
                        || !infusion.duration().is_finite()
                        || infusion.duration() <= 0.0
                    {
                        return Err(invalid(
                            time,
                            "infusion needs a finite amount and a positive duration",
                        ));
                    }
                    stops.push(Stop {
                        time,
                        action: Action::Dose(index),
                    });
                    stops.push(Stop {
                        time: infusion.end_time(),
                        action: Action::StopInfusion {
                            input: infusion.input(),
                            rate: infusion.rate(),
                        },
                    });
                }
                Event::Observation(_) => stops.push(Stop {
                    time,
                    action: Action::Observe,
                }),
            }
        }
        for &time in output_times {
            if !time.is_finite() || time < start {
                return Err(invalid(time, "output time is before the start or not finite"));
            }
            stops.push(Stop {
                time,
                action: Action::Grid,
            });
        }
        stops.sort_by(|a, b| {
            a.time
                .total_cmp(&b.time)
                .then(a.action.priority().cmp(&b.action.priority()))
        });
        Ok(stops)
    }

    /// Integrate `x` from `t0` to `t1` under constant infusion rates
    fn advance(
        &self,
        system: &OdeSystem,
        x: &mut [f64],
        rates: &[f64],
        t0: f64,
        t1: f64,
        workspace: &mut Workspace,
    ) -> Result<(), PharmsimError> {
        let n = x.len();
        if n == 0 {
            return Ok(());
        }
        let opts = &self.options;
        let Workspace { k, y_tmp, y_new } = workspace;

        let mut t = t0;
        let mut h = opts.initial_step(t1 - t0);
        system.derivative(t, x, rates, &mut k[0]);
        check_derivative(&k[0], t)?;

        let mut steps = 0;
        while t < t1 {
            if steps == opts.max_steps {
                return Err(PharmsimError::IntegrationDiverged {
                    time: t,
                    step: h,
                    reason: format!("exceeded {} steps before t={}", opts.max_steps, t1),
                });
            }
            steps += 1;

            let last = t + h >= t1;
            if last {
                h = t1 - t;
            }

            for (stage, (c, a)) in C.iter().zip(A.iter()).enumerate() {
                let out = if stage == 5 { &mut *y_new } else { &mut *y_tmp };
                for i in 0..n {
                    let increment: f64 = a.iter().zip(k.iter()).map(|(a, kj)| a * kj[i]).sum();
                    out[i] = x[i] + h * increment;
                }
                let input = if stage == 5 { &y_new[..] } else { &y_tmp[..] };
                system.derivative(t + c * h, input, rates, &mut k[stage + 1]);
            }

            let finite = y_new.iter().all(|v| v.is_finite());
            let err = if finite {
                let sum: f64 = (0..n)
                    .map(|i| {
                        let e = h * E.iter().zip(k.iter()).map(|(e, kj)| e * kj[i]).sum::<f64>();
                        let scale = opts.atol + opts.rtol * x[i].abs().max(y_new[i].abs());
                        (e / scale).powi(2)
                    })
                    .sum();
                let norm = (sum / n as f64).sqrt();
                if norm.is_nan() {
                    f64::INFINITY
                } else {
                    norm
                }
            } else {
                f64::INFINITY
            };

            if err <= 1.0 {
                t = if last { t1 } else { t + h };
                x.copy_from_slice(&y_new[..]);
                k.swap(0, 6);
                check_derivative(&k[0], t)?;
            } else {
                tracing::trace!(time = t, step = h, error = err, "step rejected");
            }

            let factor = if err == 0.0 {
                5.0
            } else {
                (0.9 * err.powf(-0.2)).clamp(0.2, 5.0)
            };
            h = (h * factor).min(opts.h_max);
            if err > 1.0 && h < opts.h_min {
                return Err(PharmsimError::IntegrationDiverged {
                    time: t,
                    step: h,
                    reason: "step size fell below h_min without meeting the tolerance"
                        .to_string(),
                });
            }
            h = h.max(opts.h_min);
        }
        Ok(())
    }
}

fn check_finite(x: &[f64], time: f64) -> Result<(), PharmsimError> {
    match x.iter().position(|v| !v.is_finite()) {
        Some(compartment) => Err(PharmsimError::NonFiniteState { time, compartment }),
        None => Ok(()),
    }
}

/// A non-finite derivative makes the next state non-finite
fn check_derivative(dx: &[f64], time: f64) -> Result<(), PharmsimError> {
    check_finite(dx, time)
}
