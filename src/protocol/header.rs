use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::protocol::ProtocolError;

/// Length of the proto-header that precedes every json header.
pub const PROTOHEADER_LEN: usize = 2;

/// Text encodings a controller may declare for a message body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentEncoding {
    Utf8,
    Utf7,
    Utf32,
    /// UTF-16, little endian.
    Unicode,
    Ascii,
}

impl ContentEncoding {
    pub fn parse(name: &str) -> Result<Self, ProtocolError> {
        match name.to_ascii_lowercase().as_str() {
            "utf-8" => Ok(Self::Utf8),
            "utf-7" => Ok(Self::Utf7),
            "utf-32" => Ok(Self::Utf32),
            "unicode" => Ok(Self::Unicode),
            "ascii" => Ok(Self::Ascii),
            _ => Err(ProtocolError::UnknownEncoding(name.to_owned())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Utf8 => "utf-8",
            Self::Utf7 => "utf-7",
            Self::Utf32 => "utf-32",
            Self::Unicode => "unicode",
            Self::Ascii => "ascii",
        }
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<String, ProtocolError> {
        match self {
            Self::Utf8 => String::from_utf8(bytes.to_vec())
                .map_err(|e| invalid(self.as_str(), e.to_string())),
            // Non-ASCII bytes are replaced, the way the controller's own
            // ASCII codec does it.
            Self::Ascii => Ok(bytes
                .iter()
                .map(|&b| if b.is_ascii() { b as char } else { '?' })
                .collect()),
            Self::Unicode => {
                if bytes.len() % 2 != 0 {
                    return Err(invalid(self.as_str(), format!("odd length {}", bytes.len())));
                }
                let units: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]]))
                    .collect();
                String::from_utf16(&units).map_err(|e| invalid(self.as_str(), e.to_string()))
            }
            Self::Utf32 => {
                if bytes.len() % 4 != 0 {
                    return Err(invalid(self.as_str(), format!("length {} is not a multiple of 4", bytes.len())));
                }
                bytes
                    .chunks_exact(4)
                    .map(|c| {
                        let code = u32::from_le_bytes([c[0], c[1], c[2], c[3]]);
                        char::from_u32(code)
                            .ok_or_else(|| invalid("utf-32", format!("invalid scalar 0x{code:x}")))
                    })
                    .collect()
            }
            Self::Utf7 => decode_utf7(bytes),
        }
    }
}

fn invalid(encoding: &'static str, reason: String) -> ProtocolError {
    ProtocolError::InvalidText { encoding, reason }
}

fn base64_value(c: u8) -> Option<u32> {
    match c {
        b'A'..=b'Z' => Some((c - b'A') as u32),
        b'a'..=b'z' => Some((c - b'a') as u32 + 26),
        b'0'..=b'9' => Some((c - b'0') as u32 + 52),
        b'+' => Some(62),
        b'/' => Some(63),
        _ => None,
    }
}

/// RFC 2152 decoding: direct ASCII plus `+...-` runs of modified base64
/// carrying UTF-16 code units.
fn decode_utf7(bytes: &[u8]) -> Result<String, ProtocolError> {
    let mut out = String::with_capacity(bytes.len());
    let mut units: Vec<u16> = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if !b.is_ascii() {
            return Err(invalid("utf-7", format!("byte 0x{b:02x} at offset {i}")));
        }
        i += 1;
        if b != b'+' {
            out.push(b as char);
            continue;
        }
        if bytes.get(i) == Some(&b'-') {
            out.push('+');
            i += 1;
            continue;
        }
        units.clear();
        let mut bits: u32 = 0;
        let mut nbits: u32 = 0;
        while let Some(v) = bytes.get(i).and_then(|&c| base64_value(c)) {
            bits = (bits << 6) | v;
            nbits += 6;
            if nbits >= 16 {
                nbits -= 16;
                units.push((bits >> nbits) as u16);
                bits &= (1 << nbits) - 1;
            }
            i += 1;
        }
        if bytes.get(i) == Some(&b'-') {
            i += 1;
        }
        for c in char::decode_utf16(units.iter().copied()) {
            out.push(c.map_err(|e| invalid("utf-7", e.to_string()))?);
        }
    }
    Ok(out)
}

/// The json header that sits between the proto-header and the body.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct FrameHeader {
    #[serde(default)]
    pub byteorder: String,
    #[serde(default)]
    pub content_type: String,
    pub content_encoding: String,
    pub content_length: u32,
}

impl FrameHeader {
    /// Parses a header, accepting `content-length` as well as `content_length`.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let text =
            std::str::from_utf8(bytes).map_err(|e| ProtocolError::MalformedHeader(e.to_string()))?;
        let raw: Map<String, Value> = serde_json::from_str(text)
            .map_err(|e| ProtocolError::MalformedHeader(e.to_string()))?;
        let normalized: Map<String, Value> = raw
            .into_iter()
            .map(|(key, value)| (key.replace('-', "_"), value))
            .collect();
        serde_json::from_value(Value::Object(normalized))
            .map_err(|e| ProtocolError::MalformedHeader(e.to_string()))
    }

    pub fn encoding(&self) -> Result<ContentEncoding, ProtocolError> {
        ContentEncoding::parse(&self.content_encoding)
    }

    /// Header for a client-originated body. The controller reads the
    /// hyphenated keys, and the declared byteorder stays `little` even though
    /// the proto-header itself is network order.
    pub fn outbound(content_length: usize) -> Value {
        json!({
            "byteorder": "little",
            "content-type": "text/json",
            "content-encoding": "utf-8",
            "content-length": content_length,
        })
    }
}
