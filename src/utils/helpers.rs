use crate::git::error::ObjectParseError;
use std::str::FromStr;

/// Splits `input` around the first occurrence of `needle`, dropping the needle.
pub fn split_once_byte(input: &[u8], needle: u8) -> Option<(&[u8], &[u8])> {
    let at = input.iter().position(|b| *b == needle)?;
    Some((&input[..at], &input[at + 1..]))
}

pub fn from_utf8_with_context(input: &[u8]) -> Result<&str, ObjectParseError> {
    std::str::from_utf8(input)
        .map_err(|_| ObjectParseError::InvalidUtf8(String::from_utf8_lossy(input).into_owned()))
}

/// Parses an ASCII number (or anything `FromStr`) straight out of a byte slice.
pub fn parse_bytes<Output: FromStr>(input: &[u8]) -> Option<Output> {
    std::str::from_utf8(input).ok()?.parse().ok()
}
