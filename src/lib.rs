//! Serve static resources and templates, compiling LESS, scripts and JSON on
//! demand and keeping each result until one of the files it was built from
//! changes.

pub mod application;
pub mod cache;
pub mod config;
pub mod convert;
pub mod infra;
pub mod resources;
pub mod templates;
