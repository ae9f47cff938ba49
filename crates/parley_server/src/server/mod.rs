#![forbid(unsafe_code)]

pub mod auth;
pub mod fanout;
pub mod gateway;
pub mod health;
pub mod listener;
pub mod log;
pub mod presence;
pub mod profiles;
pub mod registry;
pub mod search;
pub mod session;

#[cfg(test)]
mod fanout_tests;

#[cfg(test)]
mod gateway_tests;


#[cfg(test)]
mod registry_tests;
