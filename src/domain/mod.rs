//! Domain Layer
//!
//! Entities, value objects, errors and the ports the use cases depend on.

pub mod entities;
pub mod errors;
pub mod ports;
pub mod value_objects;
