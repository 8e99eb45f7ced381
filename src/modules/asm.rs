//! A small assembler for hand-written contracts.
//!
//! One instruction per line, `;` starts a comment. `@name` on its own line defines a label and
//! emits a `JUMPDEST`; `PUSH @name` pushes the label's offset as two bytes. `PUSH value` picks the
//! narrowest push for a hex or decimal value, `PUSHn value` forces the width, and
//! `SELECTOR signature` pushes a four-byte function selector.

use std::collections::HashMap;
use thiserror::Error;

use crate::modules::abi::{canonical, selector, AbiError};
use crate::modules::op::op_from_mnemonic;
use crate::modules::types::W256;

#[derive(Debug, Error)]
pub enum AsmError {
  #[error("line {line}: unknown mnemonic `{name}`")]
  UnknownMnemonic { line: usize, name: String },
  #[error("line {line}: `{name}` needs an operand")]
  MissingOperand { line: usize, name: String },
  #[error("line {line}: unexpected operand `{operand}`")]
  UnexpectedOperand { line: usize, operand: String },
  #[error("line {line}: bad value `{value}`")]
  BadValue { line: usize, value: String },
  #[error("line {line}: value does not fit in {width} byte(s)")]
  ValueTooWide { line: usize, width: usize },
  #[error("label `{0}` defined twice")]
  DuplicateLabel(String),
  #[error("label `{0}` is never defined")]
  UndefinedLabel(String),
  #[error("code does not fit in 64KiB")]
  CodeTooLarge,
  #[error("line {line}: {source}")]
  Abi {
    line: usize,
    #[source]
    source: AbiError,
  },
}

const JUMPDEST: u8 = 0x5b;
const PUSH1: u8 = 0x60;
const PUSH2: u8 = 0x61;

fn minimal_width(w: &W256) -> usize {
  w.to_be_bytes().iter().position(|b| *b != 0).map(|i| 32 - i).unwrap_or(1)
}

fn push_word(code: &mut Vec<u8>, w: &W256, width: usize) {
  code.push(PUSH1 + width as u8 - 1);
  code.extend_from_slice(&w.to_be_bytes()[32 - width..]);
}

pub fn assemble(source: &str) -> Result<Vec<u8>, AsmError> {
  let mut code = vec![];
  let mut labels: HashMap<String, usize> = HashMap::new();
  let mut fixups: Vec<(usize, String)> = vec![];

  for (idx, raw) in source.lines().enumerate() {
    let line = idx + 1;
    let text = raw.split(';').next().unwrap_or("").trim();
    if text.is_empty() {
      continue;
    }
    if let Some(name) = text.strip_prefix('@') {
      let name = name.trim_end_matches(':').to_string();
      if labels.insert(name.clone(), code.len()).is_some() {
        return Err(AsmError::DuplicateLabel(name));
      }
      code.push(JUMPDEST);
      continue;
    }

    let (mnemonic, operand) = match text.split_once(char::is_whitespace) {
      Some((m, rest)) => (m.to_ascii_uppercase(), Some(rest.trim())),
      None => (text.to_ascii_uppercase(), None),
    };
    let missing = || AsmError::MissingOperand { line, name: mnemonic.clone() };

    if mnemonic == "SELECTOR" {
      let sig = canonical(operand.ok_or_else(missing)?).map_err(|source| AsmError::Abi { line, source })?;
      code.push(PUSH1 + 3);
      code.extend_from_slice(&selector(&sig));
      continue;
    }

    if mnemonic == "PUSH" || (mnemonic.starts_with("PUSH") && mnemonic != "PUSH0") {
      let operand = operand.ok_or_else(missing)?;
      let forced = match mnemonic.as_str() {
        "PUSH" => None,
        _ => match op_from_mnemonic(&mnemonic) {
          Some(op) => Some((op - PUSH1) as usize + 1),
          None => return Err(AsmError::UnknownMnemonic { line, name: mnemonic.clone() }),
        },
      };
      if let Some(label) = operand.strip_prefix('@') {
        if let Some(width) = forced.filter(|w| *w != 2) {
          return Err(AsmError::ValueTooWide { line, width });
        }
        code.push(PUSH2);
        fixups.push((code.len(), label.to_string()));
        code.extend_from_slice(&[0, 0]);
        continue;
      }
      let value: W256 = operand.parse().map_err(|_| AsmError::BadValue { line, value: operand.to_string() })?;
      let width = minimal_width(&value);
      match forced {
        Some(w) if w < width => return Err(AsmError::ValueTooWide { line, width: w }),
        Some(w) => push_word(&mut code, &value, w),
        None => push_word(&mut code, &value, width),
      }
      continue;
    }

    let op = op_from_mnemonic(&mnemonic).ok_or_else(|| AsmError::UnknownMnemonic { line, name: mnemonic.clone() })?;
    if let Some(extra) = operand {
      return Err(AsmError::UnexpectedOperand { line, operand: extra.to_string() });
    }
    code.push(op);
  }

  for (at, label) in fixups {
    let target = *labels.get(&label).ok_or(AsmError::UndefinedLabel(label))?;
    let target = u16::try_from(target).map_err(|_| AsmError::CodeTooLarge)?;
    code[at..at + 2].copy_from_slice(&target.to_be_bytes());
  }
  if code.len() > u16::MAX as usize {
    return Err(AsmError::CodeTooLarge);
  }
  Ok(code)
}

/// Creation code that runs `constructor` and then returns `runtime` as the deployed code.
/// `constructor` must fall through to its end instead of halting.
pub fn init_code(constructor: &[u8], runtime: &[u8]) -> Result<Vec<u8>, AsmError> {
  const STUB_LEN: usize = 15;
  let len = u16::try_from(runtime.len()).map_err(|_| AsmError::CodeTooLarge)?.to_be_bytes();
  let offset = u16::try_from(constructor.len() + STUB_LEN).map_err(|_| AsmError::CodeTooLarge)?.to_be_bytes();
  let mut code = constructor.to_vec();
  code.extend_from_slice(&[PUSH2, len[0], len[1], PUSH2, offset[0], offset[1], PUSH1, 0x00, 0x39]);
  code.extend_from_slice(&[PUSH2, len[0], len[1], PUSH1, 0x00, 0xf3]);
  code.extend_from_slice(runtime);
  Ok(code)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_assemble_labels_and_pushes() {
    let code = assemble(
      "PUSH 1      ; condition\n\
       PUSH @end\n\
       JUMPI\n\
       PUSH 0x1234\n\
       @end\n\
       PUSH32 0\n\
       stop",
    )
    .unwrap();
    assert_eq!(&code[..6], &[0x60, 0x01, 0x61, 0x00, 0x09, 0x57]);
    assert_eq!(&code[6..10], &[0x61, 0x12, 0x34, 0x5b]);
    assert_eq!(code[10], 0x7f);
    assert_eq!(code.len(), 10 + 33 + 1);
    assert_eq!(*code.last().unwrap(), 0x00);
  }

  #[test]
  fn test_selector_directive() {
    let code = assemble("SELECTOR transfer(address, uint256)").unwrap();
    assert_eq!(code, vec![0x63, 0xa9, 0x05, 0x9c, 0xbb]);
  }

  #[test]
  fn test_assemble_errors() {
    assert!(matches!(assemble("FROB"), Err(AsmError::UnknownMnemonic { line: 1, .. })));
    assert!(matches!(assemble("PUSH"), Err(AsmError::MissingOperand { .. })));
    assert!(matches!(assemble("PUSH1 0x100"), Err(AsmError::ValueTooWide { width: 1, .. })));
    assert!(matches!(assemble("PUSH @nowhere"), Err(AsmError::UndefinedLabel(_))));
    assert!(matches!(assemble("@a\n@a"), Err(AsmError::DuplicateLabel(_))));
    assert!(matches!(assemble("ADD 1"), Err(AsmError::UnexpectedOperand { .. })));
  }

  #[test]
  fn test_init_code_layout() {
    let runtime = vec![0x60, 0x2a, 0x00];
    let code = init_code(&[0x50], &runtime).unwrap();
    assert_eq!(code.len(), 1 + 15 + 3);
    assert_eq!(&code[1..4], &[0x61, 0x00, 0x03]);
    assert_eq!(&code[4..7], &[0x61, 0x00, 0x10]);
    assert_eq!(&code[16..], &runtime[..]);
  }
}
