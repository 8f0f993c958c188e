#![cfg_attr(not(test), forbid(unsafe_code))]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Models, configuration, and generation providers shared by the relay server.

pub mod config;
pub mod llms;
pub mod models;
