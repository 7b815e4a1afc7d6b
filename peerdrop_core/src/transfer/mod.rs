pub mod constants;
pub mod outbox;
pub mod policy;
pub mod progress;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod utils;
