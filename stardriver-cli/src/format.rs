//! Various formatting utilities.

use std::fmt;


/// Find the binary unit of a given byte count and return the count scaled down
/// to that unit.
pub fn bytes_unit(num: f32) -> (f32, &'static str) {
    match num {
        ..=1023.0 => (num, "B"),
        ..=1048575.0 => (num / 1024.0, "KiB"),
        ..=1073741823.0 => (num / 1048576.0, "MiB"),
        _ => (num / 1073741824.0, "GiB"),
    }
}

/// A wrapper that can be used to format a byte count for human-readable output.
#[derive(Debug, Clone, Copy)]
pub struct BytesFmt(pub u64);

impl fmt::Display for BytesFmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (scaled, unit) = bytes_unit(self.0 as f32);
        if unit == "B" {
            write!(f, "{} B", self.0)
        } else {
            write!(f, "{scaled:.1} {unit}")
        }
    }
}


#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn bytes() {
        assert_eq!(BytesFmt(0).to_string(), "0 B");
        assert_eq!(BytesFmt(1023).to_string(), "1023 B");
        assert_eq!(BytesFmt(1024).to_string(), "1.0 KiB");
        assert_eq!(BytesFmt(5 * 1024 * 1024).to_string(), "5.0 MiB");
        assert_eq!(BytesFmt(3 * 1024 * 1024 * 1024).to_string(), "3.0 GiB");
    }

}
