//! Utility functions and helpers

use std::time::{SystemTime, UNIX_EPOCH};

/// Get current timestamp in microseconds since epoch
pub fn timestamp_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Name of the current thread for log fields, falling back to its id.
pub fn thread_label() -> String {
    let current = std::thread::current();
    match current.name() {
        Some(name) => name.to_string(),
        None => format!("{:?}", current.id()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamps_advance() {
        let a = timestamp_us();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = timestamp_us();
        assert!(b > a);
    }

    #[test]
    fn test_thread_label() {
        let label = std::thread::Builder::new()
            .name("worker-7".into())
            .spawn(thread_label)
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(label, "worker-7");
    }
}
