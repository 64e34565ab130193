//! Conversion between the canonical types and the two wire formats
//!
//! `openai` validates inbound requests and renders outbound chunks,
//! `kiro` builds the upstream conversation payload.

pub mod kiro;
pub mod openai;
