use std::{
    fmt::{self, Display, Formatter},
    str::FromStr,
};

pub(crate) const KB: u64 = 1 << 10;
pub(crate) const MB: u64 = 1 << 20;
pub(crate) const GB: u64 = 1 << 30;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub(crate) enum SizeError {
    #[error("invalid size format {0:?}. expected a byte count or a number followed by kb, mb or gb")]
    InvalidSizeFormat(String),
}

/// Byte count given either as plain digits or as a magnitude with a `kb`/`mb`/`gb` suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub(crate) struct Size(u64);

impl Size {
    pub(crate) const fn bytes(self) -> u64 {
        self.0
    }
}

// always decimal bytes, the library on the other side doesn't understand units
impl Display for Size {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Size {
    type Err = SizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s).map(Size)
    }
}

pub(crate) fn parse(text: &str) -> Result<u64, SizeError> {
    let invalid = || SizeError::InvalidSizeFormat(text.to_string());
    if !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit()) {
        return text.parse::<u64>().map_err(|_| invalid());
    }
    if text.len() < 2 || !text.is_char_boundary(text.len() - 2) {
        return Err(invalid());
    }
    let (magnitude, unit) = text.split_at(text.len() - 2);
    let unit = match unit.to_ascii_lowercase().as_str() {
        "kb" => KB,
        "mb" => MB,
        "gb" => GB,
        _ => return Err(invalid()),
    };
    let magnitude = magnitude.parse::<u64>().map_err(|_| invalid())?;
    magnitude.checked_mul(unit).ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_bytes() {
        assert_eq!(parse("512"), Ok(512));
        assert_eq!(parse("0"), Ok(0));
    }

    #[test]
    fn test_units() {
        assert_eq!(parse("4GB"), Ok(4 * GB));
        assert_eq!(parse("10kb"), Ok(10 * KB));
        assert_eq!(parse("2Mb"), Ok(2 * MB));
        assert_eq!(parse("0KB"), Ok(0));
    }

    #[test]
    fn test_invalid() {
        for text in ["7xy", "", "b", "MB", "xMB", "-1MB", "1.5GB", "4 GB", "1tb", "20000000000GB"] {
            assert_eq!(
                parse(text),
                Err(SizeError::InvalidSizeFormat(text.to_string())),
                "{:?} must be rejected",
                text
            );
        }
    }

    #[test]
    fn test_from_str_displays_bytes() {
        let size: Size = "1MB".parse().unwrap();
        assert_eq!(size.bytes(), MB);
        assert_eq!(size.to_string(), "1048576");
    }
}
