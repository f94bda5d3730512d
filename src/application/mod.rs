//! Application layer: collaborator ports, the error surface and the engine facade.

pub mod clock;
pub mod engine;
pub mod error;
pub mod repos;
