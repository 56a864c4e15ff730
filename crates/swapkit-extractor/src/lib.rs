//! Components of the `swapkit-extractor` helper binary.

pub mod cli;
pub mod logging;
pub mod prompt;
pub mod run;
