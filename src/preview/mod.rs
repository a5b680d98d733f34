//! Live preview: tonemapping raw frames and scheduling refreshes.

mod scheduler;
mod tonemap;

pub(crate) use scheduler::{RefreshScheduler, Selection};
pub(crate) use tonemap::{Converter, TonemapPipeline};
