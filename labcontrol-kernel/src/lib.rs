//! LabControl kernel: reservation and capture orchestration for shared lab hardware.
//!
//! Boards and resources are JSON records; reservations live on board records,
//! capture sessions live as PID and data files, and every hardware operation is a
//! command template expanded from record attributes and exec'd directly.

pub mod actions;
pub mod auth;
pub mod capture;
pub mod clock;
pub mod config;
pub mod error;
pub mod gate;
pub mod http;
pub mod interpolate;
pub mod lab;
pub mod models;
pub mod registry;
pub mod reservation;
pub mod runner;
pub mod store;
pub mod webterm;

pub use error::{LabError, LabResult, TemplateError};
pub use lab::Lab;
