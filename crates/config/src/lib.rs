//! Configuration for hlsenc: TOML-backed, with `${NAME}` environment
//! interpolation applied to path fields before parsing.

pub mod config;

pub use config::*;
