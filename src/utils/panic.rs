//! Formatting of panic payloads caught at dispatch boundaries.

use std::any::Any;
use std::fmt;

/// Displays a panic payload, downcasting to `String` or `&'static str` when possible.
#[derive(Debug)]
#[must_use]
pub struct PanicMessage(Box<dyn Any + Send>);

impl fmt::Display for PanicMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = self.0.downcast_ref::<String>() {
            f.write_str(s)
        } else if let Some(s) = self.0.downcast_ref::<&'static str>() {
            f.write_str(s)
        } else {
            f.write_str("non-string panic payload")
        }
    }
}

pub fn format_panic(panic: Box<dyn Any + Send>) -> PanicMessage {
    PanicMessage(panic)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_common_payloads() {
        assert_eq!(format_panic(Box::new("boom")).to_string(), "boom");
        assert_eq!(format_panic(Box::new(String::from("bang"))).to_string(), "bang");
        assert_eq!(
            format_panic(Box::new(5_u32)).to_string(),
            "non-string panic payload"
        );
    }
}
