//! # Core Abstractions
//!
//! Data types shared by the compiler and the VM.
//!
//! - **[`node`]**, **[`graph`]:** the task graph, an arena of typed nodes addressed by [`node::NodeId`].
//! - **[`value`]:** task arguments, either primitives or shared host buffers.
//! - **[`task`]:** schedulable task descriptors and argument access modes.
//! - **[`sketch`]:** precomputed access summaries for compilable methods.
//! - **[`device`]:** device addresses and `driver:device` strings.
//! - **[`config`]:** runtime configuration.

pub mod config;
pub mod device;
pub mod graph;
pub mod node;
pub mod sketch;
pub mod task;
pub mod value;
