pub mod record;
pub mod single;
pub mod status;
pub mod sweep;
pub mod watch;
