pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod executor;
pub mod layout;
pub mod lifecycle;
pub mod log_sanitize;
pub mod modules;
pub mod packager;
pub mod planner;
pub mod recipe;
pub mod remote;
pub mod resolver;
pub mod settings;
pub mod toolchain;
pub mod version;
pub mod workspace;

pub use error::{Error, Result};
