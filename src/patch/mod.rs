// Patch application.
//
// - `reassembler` — rebuilds block delta records from download packets
// - `applier`     — reconstructs and verifies one block from its record

pub mod applier;
pub mod reassembler;

pub use applier::{BlockOutput, BlockPatcher, ControlTriple, DecodedBlock, PatchError};
pub use reassembler::{BlockDeltaRecord, Reassembler};
