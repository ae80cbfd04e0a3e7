pub mod builder;
pub mod covariate;
pub mod event;
pub mod structs;
pub use builder::IndividualBuilder;
pub use covariate::*;
pub use event::*;
pub use structs::{Individual, Record};
