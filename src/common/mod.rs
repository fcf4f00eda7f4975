//! Shared record types and collaborator traits

pub mod traits;
pub mod types;
