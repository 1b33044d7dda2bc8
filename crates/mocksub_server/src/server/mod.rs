#![forbid(unsafe_code)]

pub mod connection;
pub mod control;
pub mod http;
pub mod instance;
pub mod manager;
pub mod registry;

#[cfg(test)]
mod control_tests;
