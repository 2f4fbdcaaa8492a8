#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

pub mod cache;
pub mod engine;
mod error;
pub mod graph;
pub mod hash;
pub mod poller;
pub mod protocol;
pub mod reductor;
pub mod status;
pub mod storage;
pub mod store;
pub mod thunk;
mod utils;

pub use crate::error::*;
pub use crate::hash::{Hash, ObjectType};
pub use crate::reductor::Reductor;
pub use crate::utils::{format_bytes, init_logging};
