//! In-place, non-destructive conversion of an NTFS volume on a block
//! device into a Linux filesystem.
//!
//! The conversion runs as a bounded iterative pipeline: shrink the NTFS
//! volume toward its live data, claim the freed tail as a growing target
//! volume, migrate a verified prefix of files, prune them from the source,
//! and repeat until the source is empty. Its final region is then handed
//! to the target.

pub mod convert;
