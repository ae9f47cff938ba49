#![forbid(unsafe_code)]

pub mod secret;
pub mod time;
