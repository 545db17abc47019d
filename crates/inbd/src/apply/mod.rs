//! Family-specific mutation of the system: image slots, packages, kernel
//! arguments.

pub mod image;
pub mod kernel_args;
pub mod package;

pub use package::{DryRun, PackagePlan};
