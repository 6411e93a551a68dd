use crate::Error;
use std::str::FromStr;

/// Convenience trait to easily convert errors to `Error::InvalidFrame`
pub trait ResultExt<T> {
    fn or_invalid_frame(self) -> Result<T, Error>;
}

impl<T, E> ResultExt<T> for Result<T, E> {
    fn or_invalid_frame(self) -> Result<T, Error> {
        self.or(Err(Error::InvalidFrame))
    }
}

impl<T> ResultExt<T> for Option<T> {
    fn or_invalid_frame(self) -> Result<T, Error> {
        self.ok_or(Error::InvalidFrame)
    }
}

/// Parses a decoded numeric argument
pub fn parse_arg<T: FromStr>(arg: &str) -> Result<T, Error> {
    arg.parse().or_invalid_frame()
}

/// Absent optional strings travel as the empty string
pub fn optional_arg(arg: String) -> Option<String> {
    Some(arg).filter(|s| !s.is_empty())
}
