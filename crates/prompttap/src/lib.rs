pub mod capture;
pub mod config;
pub mod correlate;
pub mod error;
pub mod extract;
pub mod pipeline;
pub mod reassembly;
pub mod status;
pub mod storage;
pub mod testing;

pub use config::Config;
pub use error::{Result, TapError};
