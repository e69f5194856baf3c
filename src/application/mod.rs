//! Application services: asset delivery and the error surface shared by the HTTP layer.

pub mod assets;
pub mod error;
