//! Domain core for the ComfyUI chat bot.
//!
//! Pure logic with no network I/O: parameter parsing, generation modes,
//! job records and the per-user queue manager. The `comfyui` and
//! `pipeline` crates build on top of these types.

pub mod error;
pub mod job;
pub mod markup;
pub mod modes;
pub mod params;
pub mod queue;
pub mod resolution;
pub mod types;
