//! Portal DNS - a captive-portal DNS interception proxy.
//!
//! Authorized clients are proxied to a real resolver; everyone else has every
//! name resolved to the portal address.

pub mod dns;
pub mod engine;
pub mod error;
pub mod pending;
pub mod policy;
pub mod proxy;
pub mod stats;
pub mod synth;
