//! Stage pipeline.
//!
//! Every entity stage runs through the same loop, parameterized by a
//! [`StageSpec`] capability row:
//!
//! - read a batch of source rows by keyset (`id > last_id`)
//! - transform each row and resolve its canonical user
//! - write the batch in one target transaction
//! - record the ID mapping, counters, and warnings
//!
//! [`plan`] rejects a stage selection whose dependencies are neither
//! selected nor already completed, before anything is written.

mod runner;
mod stage;

pub use runner::{RunnerOptions, StageEnd, StageRunner};
pub use stage::{check_ready, plan, spec, StageSpec, STAGES};
