//! Core engine: types, parsing, resolution, validation, verification,
//! execution, repair.

pub mod config;
pub mod error;
pub mod executor;
pub mod parser;
pub mod repair;
pub mod resolver;
pub mod state;
pub mod types;
pub mod validator;
pub mod verifier;
