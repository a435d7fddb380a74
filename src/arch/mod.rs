//! Target-ISA immediate heuristics used by the optimizer.
//!
//! The predicates here must agree bit-exactly with the encodings the
//! assembler accepts; a value the optimizer inlines that the emitter then
//! cannot encode is a compile abort, not a fallback.

pub mod aarch64;
