use thiserror::Error;
use tiny_keccak::{Hasher, Keccak};

use crate::modules::types::{concrete_buf, word_cells, Buf, Expr};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AbiError {
  #[error("malformed function signature `{0}`")]
  MalformedSignature(String),
  #[error("unsupported argument type `{0}`; only static one-word types are encoded")]
  UnsupportedType(String),
  #[error("`{signature}` takes {expected} argument(s), got {got}")]
  ArityMismatch { signature: String, expected: usize, got: usize },
}

pub fn keccak(input: &[u8]) -> [u8; 32] {
  let mut hasher = Keccak::v256();
  hasher.update(input);
  let mut output = [0u8; 32];
  hasher.finalize(&mut output);
  output
}

/// First four bytes of the keccak hash of the canonical signature.
pub fn selector(signature: &str) -> [u8; 4] {
  let hash = keccak(signature.as_bytes());
  [hash[0], hash[1], hash[2], hash[3]]
}

fn is_word_type(t: &str) -> bool {
  let sized = |prefix: &str, max: u32, step: u32| match t.strip_prefix(prefix) {
    Some("") => prefix != "bytes",
    Some(n) => n.parse::<u32>().map(|n| n > 0 && n <= max && n % step == 0).unwrap_or(false),
    None => false,
  };
  t == "address" || t == "bool" || sized("uint", 256, 8) || sized("int", 256, 8) || sized("bytes", 32, 1)
}

/// Splits `name(t1,t2)` into its name and argument types.
pub fn parse_signature(signature: &str) -> Result<(String, Vec<String>), AbiError> {
  let malformed = || AbiError::MalformedSignature(signature.to_string());
  let open = signature.find('(').ok_or_else(malformed)?;
  let inner = signature[open + 1..].strip_suffix(')').ok_or_else(malformed)?;
  let name = &signature[..open];
  if name.is_empty() || name.contains(char::is_whitespace) || inner.contains(['(', ')']) {
    return Err(malformed());
  }
  let types: Vec<String> =
    if inner.trim().is_empty() { vec![] } else { inner.split(',').map(|t| t.trim().to_string()).collect() };
  for t in &types {
    if !is_word_type(t) {
      return Err(AbiError::UnsupportedType(t.clone()));
    }
  }
  Ok((name.to_string(), types))
}

/// Signature with whitespace removed, as hashed for the selector.
pub fn canonical(signature: &str) -> Result<String, AbiError> {
  let (name, types) = parse_signature(signature)?;
  Ok(format!("{}({})", name, types.join(",")))
}

/// Selector followed by one 32-byte word per argument; symbolic words stay symbolic.
pub fn encode_call(signature: &str, args: &[Expr]) -> Result<Buf, AbiError> {
  let (name, types) = parse_signature(signature)?;
  if types.len() != args.len() {
    return Err(AbiError::ArityMismatch { signature: signature.to_string(), expected: types.len(), got: args.len() });
  }
  let mut buf = concrete_buf(&selector(&format!("{}({})", name, types.join(","))));
  for arg in args {
    buf.extend(word_cells(arg));
  }
  Ok(buf)
}
