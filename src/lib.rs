#![doc = include_str!("../README.md")]

pub mod cli;
pub mod compare;
pub mod config;
pub mod engine;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod log;
pub mod normalize;
pub mod registry;
pub mod report;
pub mod schema;
pub mod store;
pub mod types;

pub use engine::{Engine, OriginSource};
pub use error::{ParityError, Result};
pub use types::*;
