pub mod link;
pub mod memory;
pub mod negotiator;
