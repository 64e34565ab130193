//! Wire format types for the two protocols the gateway bridges
//!
//! Pure serde structs used only at the boundary: `openai` for the
//! caller-facing API and `kiro` for the upstream's JSON payloads.

pub mod kiro;
pub mod openai;
