//! Core types for the fieldmesh messaging layer.
//!
//! This crate defines the message envelope and its wire codec, the payload
//! value model (including packed n-dimensional arrays), the conventional
//! message keys, and the configuration structs shared by nodes and routers.
//! It performs no I/O.

pub mod array;
pub mod config;
pub mod error;
pub mod keys;
pub mod message;
pub mod value;

pub use array::{ArrayData, DType, NdArray, PackedArray};
pub use config::{NodeConfig, RouterConfig, UpstreamConfig};
pub use error::{MessageError, MessageResult};
pub use message::{Address, Flag, Message};
pub use value::Value;
