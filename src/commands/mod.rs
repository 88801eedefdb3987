pub mod import;
pub mod reset;
pub mod status;
pub mod workflow;
