//! Shared data model for remix batches: descriptors, fragments,
//! outcomes, quota records and their storage port, plus the run journal.

pub mod assets;
pub mod descriptors;
pub mod events;
pub mod fragments;
pub mod outcomes;
pub mod quota;
pub mod summary;

pub use assets::BinaryAsset;
pub use descriptors::{Descriptor, DescriptorBatchBuilder, VariationKind};
pub use fragments::ResponseFragment;
pub use outcomes::{BatchRecorder, BatchResult, BatchStatus, ErrorKind, GenerationOutcome};
