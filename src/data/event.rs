use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::PharmsimError;

/// Represents a dosing action or an observation request
///
/// Events are applied by the integrator in time order. At equal times every
/// dose is applied before any observation is taken, so an observation at the
/// time of a dose sees the dose.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Event {
    /// A bolus dose (instantaneous drug input)
    Bolus(Bolus),
    /// An infusion (continuous drug input over a duration)
    Infusion(Infusion),
    /// A request for a state snapshot
    Observation(Observation),
}

impl Event {
    /// Get the time of the event
    pub fn time(&self) -> f64 {
        match self {
            Event::Bolus(bolus) => bolus.time,
            Event::Infusion(infusion) => infusion.time,
            Event::Observation(observation) => observation.time,
        }
    }

    /// Tie-break priority at equal times, lower goes first
    pub(crate) fn priority(&self) -> u8 {
        match self {
            Event::Bolus(_) | Event::Infusion(_) => 0,
            Event::Observation(_) => 1,
        }
    }

    /// The event identifier reported in output rows (1 for doses, 0 otherwise)
    pub fn evid(&self) -> u8 {
        match self {
            Event::Bolus(_) | Event::Infusion(_) => 1,
            Event::Observation(_) => 0,
        }
    }

    /// The compartment receiving a dose, if any
    pub fn input(&self) -> Option<usize> {
        match self {
            Event::Bolus(bolus) => Some(bolus.input),
            Event::Infusion(infusion) => Some(infusion.input),
            Event::Observation(_) => None,
        }
    }

    /// Total ordering used to schedule events: by time, then by priority.
    ///
    /// The sort using this ordering must be stable so that doses given at the
    /// same time keep their input order.
    pub(crate) fn schedule_cmp(&self, other: &Event) -> Ordering {
        self.time()
            .total_cmp(&other.time())
            .then(self.priority().cmp(&other.priority()))
    }

    /// Increment the event time by a specified delta
    pub(crate) fn inc_time(&mut self, dt: f64) {
        match self {
            Event::Bolus(bolus) => bolus.time += dt,
            Event::Infusion(infusion) => infusion.time += dt,
            Event::Observation(observation) => observation.time += dt,
        }
    }
}

/// Represents an instantaneous input of drug
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Bolus {
    time: f64,
    amount: f64,
    input: usize,
}

impl Bolus {
    /// Create a new bolus event
    ///
    /// # Arguments
    ///
    /// * `time` - Time of the bolus dose
    /// * `amount` - Amount of drug administered
    /// * `input` - The compartment index (zero-indexed) receiving the dose
    pub fn new(time: f64, amount: f64, input: usize) -> Self {
        Bolus {
            time,
            amount,
            input,
        }
    }
    /// Get the amount of drug in the bolus
    pub fn amount(&self) -> f64 {
        self.amount
    }
    /// Get the compartment index that receives the bolus
    pub fn input(&self) -> usize {
        self.input
    }
    /// Get the time of the bolus administration
    pub fn time(&self) -> f64 {
        self.time
    }
}

/// Represents a continuous dose of drug over time
///
/// An [Infusion] administers drug at a constant rate from `time` until
/// `time + duration`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Infusion {
    time: f64,
    amount: f64,
    input: usize,
    duration: f64,
}

impl Infusion {
    /// Create a new infusion event from its total amount and duration
    pub fn new(time: f64, amount: f64, input: usize, duration: f64) -> Self {
        Infusion {
            time,
            amount,
            input,
            duration,
        }
    }

    /// Create a new infusion event from its total amount and constant rate
    ///
    /// Both must be finite and positive, otherwise the duration would be zero,
    /// infinite or undefined.
    pub fn from_rate(
        time: f64,
        amount: f64,
        input: usize,
        rate: f64,
    ) -> Result<Self, PharmsimError> {
        if !(amount.is_finite() && amount > 0.0 && rate.is_finite() && rate > 0.0) {
            return Err(PharmsimError::InvalidEvent {
                time,
                reason: format!(
                    "infusion by rate needs a positive amount and rate, got {} and {}",
                    amount, rate
                ),
            });
        }
        Ok(Infusion::new(time, amount, input, amount / rate))
    }

    /// Get the total amount of drug provided over the infusion
    pub fn amount(&self) -> f64 {
        self.amount
    }
    /// Get the compartment index that receives the infusion
    pub fn input(&self) -> usize {
        self.input
    }
    /// Get the duration of the infusion
    pub fn duration(&self) -> f64 {
        self.duration
    }
    /// Get the start time of the infusion
    pub fn time(&self) -> f64 {
        self.time
    }
    /// Get the time at which the infusion stops
    pub fn end_time(&self) -> f64 {
        self.time + self.duration
    }
    /// Amount per unit of time delivered while the infusion runs
    pub fn rate(&self) -> f64 {
        self.amount / self.duration
    }
}

/// Represents a request for the model state at a given time
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Observation {
    time: f64,
}

impl Observation {
    pub fn new(time: f64) -> Self {
        Observation { time }
    }
    /// Get the time of the observation
    pub fn time(&self) -> f64 {
        self.time
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Bolus(bolus) => write!(
                f,
                "Bolus: time={:.2}, amount={:.2}, input={}",
                bolus.time, bolus.amount, bolus.input
            ),
            Event::Infusion(infusion) => write!(
                f,
                "Infusion: time={:.2}, amount={:.2}, input={}, duration={:.2}",
                infusion.time, infusion.amount, infusion.input, infusion.duration
            ),
            Event::Observation(observation) => {
                write!(f, "Observation: time={:.2}", observation.time)
            }
        }
    }
}
