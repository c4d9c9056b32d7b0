//! Small helpers shared by the library and the binary.

use chrono::{DateTime, NaiveDateTime, Utc};
use rand::Rng;

/// Initialize env_logger, tolerating repeated calls from tests.
pub fn init_logs() {
    let _ = env_logger::try_init();
}

/// Render a UNIX-seconds timestamp for listings.
pub fn format_time(secs: u64) -> String {
    match NaiveDateTime::from_timestamp_opt(secs as i64, 0) {
        Some(naive) => DateTime::<Utc>::from_utc(naive, Utc)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
        None => format!("@{}", secs),
    }
}

pub fn create_uuid() -> [u8; 16] {
    let mut rng = rand::thread_rng();
    (0..16)
        .map(|_| rng.gen::<u8>())
        .collect::<Vec<u8>>()
        .try_into()
        .unwrap()
}

/// Print an expression alongside its value while debugging.
#[macro_export]
macro_rules! prv {
    ($($e:expr),+) => {
        {
            log::debug!("{}", vec![$(format!("{} = {:?}", stringify!($e), $e)),+].join(", "));
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_rendering() {
        assert_eq!(format_time(0), "1970-01-01 00:00:00");
        assert!(format_time(1_700_000_000).starts_with("2023-11-14"));
    }

    #[test]
    fn uuid_is_filled() {
        let a = create_uuid();
        let b = create_uuid();
        // 16 random bytes colliding would mean a broken generator
        assert_ne!(a, b);
    }
}
