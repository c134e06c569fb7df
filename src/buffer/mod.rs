//! Bounded memory primitives for the pipeline
//!
//! The ring arena and the work queue are the only channels between pipeline
//! stages: a slow consumer throttles the producer automatically, bounding
//! memory use regardless of total data volume.

pub mod queue;
pub mod ring;

pub use queue::WorkQueue;
pub use ring::{Allocation, RingBuffer};
