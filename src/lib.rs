#![doc = include_str!("../README.md")]
#![deny(unreachable_pub)]

pub mod config;
pub mod dict;
pub mod error;

pub use dict::{Dict, Predicate, Resolution};
pub use error::{Error, Result};
