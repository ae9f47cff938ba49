#![forbid(unsafe_code)]

//! Parley messaging and presence server: QUIC sessions in front of the gateway,
//! with optional SQL persistence.

pub mod config;
pub mod quic;
pub mod server;
pub mod storage;
pub mod util;
