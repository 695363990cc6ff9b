//! Process inspection through the Linux `/proc` filesystem.

pub mod parser;
pub mod probe;

pub use parser::{ParseError, ProcStatus};
pub use probe::ProcessProbe;
