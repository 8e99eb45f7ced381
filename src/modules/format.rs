use hex::decode as hex_decode;

pub fn strip_0x_str(s: &str) -> &str {
  s.strip_prefix("0x").unwrap_or(s)
}

/// Decodes hex text, tolerating a `0x` prefix and surrounding whitespace.
pub fn hex_byte_string(s: &str) -> Result<Vec<u8>, hex::FromHexError> {
  let cleaned: String = strip_0x_str(s.trim()).chars().filter(|c| !c.is_whitespace()).collect();
  hex_decode(cleaned.as_bytes())
}
