#![warn(clippy::all)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::return_self_not_must_use
)]

pub mod approval;
pub mod config;
pub mod events;
pub mod gateway;
pub mod security;
pub mod session;
pub mod tools;
pub mod util;
