pub mod package;
pub mod serve;
