//! Provenance: JSONL event log and BLAKE3 queue fingerprints.

pub mod eventlog;
pub mod fingerprint;
