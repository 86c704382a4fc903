//! Value codec for goro
//!
//! Every payload crossing a worker boundary (argument lists, results,
//! thrown errors, worker data) goes through this crate: a structured value
//! model ([`Value`]), its acyclic wire form ([`WireValue`]) and the
//! [`encode`]/[`decode`] pair between them. Both transports use the same
//! codec so behavior never diverges by transport.

pub mod value;
pub mod wire;

pub use value::{ErrorValue, SharedValue, Value};
pub use wire::{decode, decode_args, encode, encode_args, WireValue};
