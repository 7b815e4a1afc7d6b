pub mod envelope;
pub mod memory;
pub mod relay;
pub mod routing;
pub mod session;
