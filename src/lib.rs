#![forbid(unsafe_code)]

pub mod adapter;
pub mod artifact;
pub mod cli;
pub mod commands;
pub mod config;
pub mod contract;
pub mod devtools;
pub mod error;
pub mod extract;
pub mod logging;
pub mod normalize;
pub mod orchestrator;
pub mod prompt;
pub mod repair;
pub mod request;
pub mod result;
pub mod source;
pub mod writer;

pub use error::CrawlError;
pub use orchestrator::{CrawlOutcome, CrawlService};
pub use request::CrawlRequest;
pub use result::CanonicalResult;
