//! Text decoding for fixed-width and pointed-to string buffers.

use crate::objects::error::{ObjectError, ObjectResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    #[default]
    Ascii,
    Utf8,
    Latin1,
    Utf16Le,
}

impl Encoding {
    pub fn name(self) -> &'static str {
        match self {
            Encoding::Ascii => "ascii",
            Encoding::Utf8 => "utf-8",
            Encoding::Latin1 => "latin-1",
            Encoding::Utf16Le => "utf-16le",
        }
    }
}

/// What to do with bytes that are not valid in the chosen encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnDecodeError {
    /// Substitute U+FFFD.
    #[default]
    Replace,
    Fail,
    /// Drop the offending bytes.
    Ignore,
}

/// Decode a text buffer.
///
/// The buffer is cut to `max_length` bytes first, then at the first NUL
/// (a zero code unit for UTF-16), so null- or garbage-padded names decode
/// to the same string whatever the padding length.
pub fn decode_text(
    bytes: &[u8],
    max_length: usize,
    encoding: Encoding,
    on_error: OnDecodeError,
    field: &str,
) -> ObjectResult<String> {
    let bytes = &bytes[..bytes.len().min(max_length)];
    let fail = || ObjectError::Encoding {
        field: field.to_string(),
        encoding: encoding.name(),
    };

    match encoding {
        Encoding::Ascii => {
            let text = until_nul(bytes);
            let mut out = String::with_capacity(text.len());
            for &b in text {
                if b.is_ascii() {
                    out.push(b as char);
                } else {
                    match on_error {
                        OnDecodeError::Replace => out.push(char::REPLACEMENT_CHARACTER),
                        OnDecodeError::Ignore => {}
                        OnDecodeError::Fail => return Err(fail()),
                    }
                }
            }
            Ok(out)
        }
        Encoding::Latin1 => Ok(until_nul(bytes).iter().map(|&b| b as char).collect()),
        Encoding::Utf8 => {
            let text = until_nul(bytes);
            match on_error {
                OnDecodeError::Replace => Ok(String::from_utf8_lossy(text).into_owned()),
                OnDecodeError::Fail => std::str::from_utf8(text)
                    .map(str::to_string)
                    .map_err(|_| fail()),
                OnDecodeError::Ignore => Ok(text.utf8_chunks().map(|c| c.valid()).collect()),
            }
        }
        Encoding::Utf16Le => {
            let units = bytes
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .take_while(|&unit| unit != 0);
            let mut out = String::new();
            for decoded in char::decode_utf16(units) {
                match (decoded, on_error) {
                    (Ok(c), _) => out.push(c),
                    (Err(_), OnDecodeError::Replace) => out.push(char::REPLACEMENT_CHARACTER),
                    (Err(_), OnDecodeError::Ignore) => {}
                    (Err(_), OnDecodeError::Fail) => return Err(fail()),
                }
            }
            Ok(out)
        }
    }
}

fn until_nul(bytes: &[u8]) -> &[u8] {
    match bytes.iter().position(|&b| b == 0) {
        Some(end) => &bytes[..end],
        None => bytes,
    }
}
