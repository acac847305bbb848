pub use self::watch::*;

pub mod request_tracker;
pub mod test_utils;
mod watch;
