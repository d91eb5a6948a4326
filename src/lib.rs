//! Answer-conditioned question generation: a passage encoder conditioned on
//! an answer span, and an attention decoder that either generates from a
//! fixed vocabulary or copies passage tokens.

pub mod attention;
pub mod batch;
pub mod beam;
pub mod bridge;
pub mod cell;
pub mod config;
pub mod copy_layer;
pub mod data_loader;
pub mod encoder;
pub mod error;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod ops;
pub mod training;
pub mod vocab;
