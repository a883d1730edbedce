use std::fmt::Write as _;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use clap::ValueEnum;
use serde::Serialize;
#[cfg(test)]
use thiserror::Error;

/// Shell dialect the replay command is quoted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QuoteStyle {
    /// POSIX shells: `'…'` words, body piped from `printf`.
    #[default]
    Single,
    /// Windows `cmd`: `"…"` words, body decoded from base64 by `certutil`.
    Double,
}

/// Which body representation(s) travel to the native host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BodyEncoding {
    EscapedHex,
    Base64,
    #[default]
    Both,
}

impl BodyEncoding {
    pub fn wants_escaped(self) -> bool {
        matches!(self, Self::EscapedHex | Self::Both)
    }

    pub fn wants_base64(self) -> bool {
        matches!(self, Self::Base64 | Self::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EncodingPolicy {
    pub quote: QuoteStyle,
    pub body: BodyEncoding,
}

#[cfg(test)]
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("expected `\\x` escape at offset {0}")]
    MissingEscape(usize),
    #[error("truncated escape at offset {0}")]
    Truncated(usize),
    #[error("invalid hex digits {digits:?} at offset {offset}")]
    InvalidHex { offset: usize, digits: String },
}

/// Renders every byte as `\xHH` (lowercase), never reinterpreting as UTF-8.
pub fn bytes_to_escaped(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 4);
    for byte in bytes {
        let _ = write!(out, "\\x{byte:02x}");
    }
    out
}

pub fn bytes_to_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Inverse of [`bytes_to_escaped`].
#[cfg(test)]
pub fn escaped_to_bytes(escaped: &str) -> Result<Vec<u8>, EncodeError> {
    let raw = escaped.as_bytes();
    let mut out = Vec::with_capacity(raw.len() / 4);
    let mut offset = 0;

    while offset < raw.len() {
        if raw.len() - offset < 4 {
            return Err(EncodeError::Truncated(offset));
        }
        if raw[offset] != b'\\' || raw[offset + 1] != b'x' {
            return Err(EncodeError::MissingEscape(offset));
        }

        let digits = &raw[offset + 2..offset + 4];
        let byte = std::str::from_utf8(digits)
            .ok()
            .and_then(|digits| u8::from_str_radix(digits, 16).ok())
            .ok_or_else(|| EncodeError::InvalidHex {
                offset,
                digits: String::from_utf8_lossy(digits).into_owned(),
            })?;
        out.push(byte);
        offset += 4;
    }

    Ok(out)
}

/// Quotes a plain word (URL, header line) for the target shell.
pub fn quote_word(value: &str, style: QuoteStyle) -> String {
    match style {
        QuoteStyle::Single => format!("'{}'", value.replace('\'', r"'\''")),
        QuoteStyle::Double => format!("\"{}\"", value.replace('"', "\\\"")),
    }
}

const WINDOWS_BODY_B64: &str = r"%TEMP%\licensetap-body.b64";
const WINDOWS_BODY_BIN: &str = r"%TEMP%\licensetap-body.bin";

/// Shell fragment that feeds `bytes` to curl, paired with the matching `--data-binary`
/// source. Bytes never travel through argv, so NUL and non-UTF-8 bytes survive.
///
/// POSIX pipes `printf '\xHH…'` into `@-`; Windows `cmd` decodes base64 into a temp file
/// with `certutil` and posts that file.
pub fn body_source(bytes: &[u8], style: QuoteStyle) -> (String, String) {
    match style {
        QuoteStyle::Single => (
            format!("printf {} | ", quote_word(&bytes_to_escaped(bytes), style)),
            "@-".to_string(),
        ),
        QuoteStyle::Double => (
            format!(
                "(echo {})>\"{WINDOWS_BODY_B64}\" && certutil -f -decode \"{WINDOWS_BODY_B64}\" \"{WINDOWS_BODY_BIN}\" >nul && ",
                bytes_to_base64(bytes)
            ),
            format!("\"@{WINDOWS_BODY_BIN}\""),
        ),
    }
}

/// Renders ` -H '<Name>: <Value>'` for each header, in arrival order.
pub fn header_flags<'a, I>(headers: I, style: QuoteStyle) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    headers
        .into_iter()
        .map(|(name, value)| format!(" -H {}", quote_word(&format!("{name}: {value}"), style)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_every_byte_as_hex() {
        assert_eq!(bytes_to_escaped(&[0x00, 0xFF, 0x41]), r"\x00\xff\x41");
        assert_eq!(bytes_to_escaped(&[]), "");
    }

    #[test]
    fn escaped_form_restores_original_bytes() {
        let bytes = [0x00, 0xFF, 0x41];
        let restored = escaped_to_bytes(&bytes_to_escaped(&bytes)).expect("valid escape");
        assert_eq!(restored, bytes);
    }

    #[test]
    fn rejects_malformed_escapes() {
        assert_eq!(escaped_to_bytes(r"\x0"), Err(EncodeError::Truncated(0)));
        assert_eq!(escaped_to_bytes("abcd"), Err(EncodeError::MissingEscape(0)));
        assert!(matches!(
            escaped_to_bytes(r"\x41\xzz"),
            Err(EncodeError::InvalidHex { offset: 4, .. })
        ));
    }

    #[test]
    fn base64_uses_standard_alphabet() {
        assert_eq!(bytes_to_base64(&[0x01, 0x02]), "AQI=");
        assert_eq!(bytes_to_base64(&[0xFB, 0xFF]), "+/8=");
    }

    #[test]
    fn posix_header_flags_escape_single_quotes() {
        let flags = header_flags(
            [("Content-Type", "application/octet-stream"), ("X-Note", "it's")],
            QuoteStyle::Single,
        );
        assert_eq!(
            flags,
            r#" -H 'Content-Type: application/octet-stream' -H 'X-Note: it'\''s'"#
        );
    }

    #[test]
    fn windows_header_flags_escape_double_quotes() {
        let flags = header_flags([("X-Json", r#"{"a":1}"#)], QuoteStyle::Double);
        assert_eq!(flags, r#" -H "X-Json: {\"a\":1}""#);
    }

    #[test]
    fn empty_header_list_renders_nothing() {
        assert_eq!(header_flags(Vec::<(&str, &str)>::new(), QuoteStyle::Single), "");
    }

    #[test]
    fn posix_body_is_piped_through_printf() {
        let (prelude, source) = body_source(&[0x00, 0x27, 0x5c], QuoteStyle::Single);
        assert_eq!(prelude, r"printf '\x00\x27\x5c' | ");
        assert_eq!(source, "@-");
    }

    #[test]
    fn windows_body_is_decoded_into_a_temp_file() {
        let (prelude, source) = body_source(&[0x01, 0x02], QuoteStyle::Double);
        assert_eq!(
            prelude,
            r#"(echo AQI=)>"%TEMP%\licensetap-body.b64" && certutil -f -decode "%TEMP%\licensetap-body.b64" "%TEMP%\licensetap-body.bin" >nul && "#
        );
        assert_eq!(source, r#""@%TEMP%\licensetap-body.bin""#);
    }

    #[test]
    fn body_encoding_flags() {
        assert!(BodyEncoding::Both.wants_base64() && BodyEncoding::Both.wants_escaped());
        assert!(!BodyEncoding::EscapedHex.wants_base64());
        assert!(!BodyEncoding::Base64.wants_escaped());
    }
}
