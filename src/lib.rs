pub mod assembly;
pub mod automation;
pub mod config;
pub mod docx;
pub mod error;
pub mod fields;
pub mod job;
pub mod logging;
pub mod prune;
pub mod rows;
pub mod textutil;

pub use assembly::{Assembler, AssemblyOptions, AssemblyReport, AssemblyRequest};
pub use error::{AssemblyError, Result};
