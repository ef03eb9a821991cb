pub mod builder;
pub mod compare;
pub mod config;
pub mod error;
pub mod image;
pub mod package;
pub mod planner;
pub mod progress;
pub mod report;
pub mod script;
pub mod tool;

pub use error::{Error, Result};
