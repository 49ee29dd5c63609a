mod schedule;
mod precision;

pub use schedule::*;
