//! Host-side API for building task schedules.
//!
//! [`TaskSchedule`] records invocations through an [`InvocationRecorder`],
//! compiles them on demand and drives the VM.

pub mod recorder;
pub mod schedule;

pub use recorder::InvocationRecorder;
pub use schedule::TaskSchedule;
