//! Stages of one repair-loop attempt.
//!
//! ## Data Flow
//!
//! ```text
//! sample ──▶ synthesize ──▶ code ──▶ sandbox ──▶ verify
//! (PDF+CSV)   (model call)  (extract)  (child proc)  (table diff)
//! ```
//!
//! 1. [`sample`]     load and validate the target's PDF / reference CSV pair;
//!    [`render`] supplies page text and optional page images
//! 2. [`synthesize`] build the cold or repair prompt and call the model, with
//!    rate-limit backoff; the only stage with network I/O
//! 3. [`code`]       pull the module out of the reply and check the entry point
//! 4. [`sandbox`]    run the candidate in a child interpreter under limits
//! 5. [`verify`]     compare the produced table with the reference

pub mod code;
pub mod render;
pub mod sample;
pub mod sandbox;
pub mod synthesize;
pub mod verify;
