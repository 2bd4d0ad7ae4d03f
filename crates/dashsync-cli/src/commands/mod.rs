pub mod config;
pub mod push;
pub mod status;
pub mod watch;
