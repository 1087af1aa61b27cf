//! Stream-level building blocks
//!
//! - Opaque transport abstraction over one PCM stream ([`transport`])
//! - Self-describing per-sample sequence tagging ([`sequence`])
//! - One directional stream plus its period buffer and sequencer ([`endpoint`])

pub mod endpoint;
pub mod sequence;
pub mod transport;
