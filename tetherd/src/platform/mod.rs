//! Host adapters for the collaborator traits.

pub mod bridge;
pub mod installer;
