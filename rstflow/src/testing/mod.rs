//! Test support for pipelines.
//!
//! - [`ScriptedRunner`]: a process runner that plays back scripted outcomes
//! - [`FakeToolkit`]: a toolkit install made of shell scripts
//! - [`write_input`]: raw input files with product-style names

mod fixtures;
mod runner;

pub use fixtures::{write_input, FakeToolkit, FAKE_MAKE_FIT, FAKE_MAKE_GRID, FAKE_SPECK_REMOVAL};
pub use runner::{ScriptedRunner, ScriptedStep};
