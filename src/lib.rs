pub mod config;
pub mod core;
pub mod demo;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod session;
pub mod util;

pub use error::{Error, Result};
