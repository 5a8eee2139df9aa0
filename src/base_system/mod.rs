//! 基础设施：配置、日志与 panic 信息提取。

use std::any::Any;

pub mod config;
pub mod context;
pub mod logging;

/// Turns a `catch_unwind` payload into a printable message.
pub fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "unknown panic payload".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic;

    #[test]
    fn extracts_static_and_formatted_messages() {
        let payload = panic::catch_unwind(|| {
            panic!("plain");
        })
        .unwrap_err();
        assert_eq!(panic_message(payload), "plain");

        let n = 3;
        let payload = panic::catch_unwind(|| {
            panic!("job {n} broke");
        })
        .unwrap_err();
        assert_eq!(panic_message(payload), "job 3 broke");

        let payload = panic::catch_unwind(|| {
            panic::panic_any(42u8);
        })
        .unwrap_err();
        assert_eq!(panic_message(payload), "unknown panic payload");
    }
}
