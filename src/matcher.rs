//! Regular expressions over opcode sequences.
//!
//! A pattern is ordinary regex syntax whose atoms are opcode mnemonics
//! (`ILOAD`), opcode groups (`ICONST`) or the wildcard `ANY`. Every opcode is
//! mapped to one private-use code point, the pattern is rewritten into a regex
//! over those code points, and a method body is rendered as a string with one
//! code point per real instruction. Matches are mapped back to instruction
//! handles, so callers can edit or remove the matched instructions directly.

use regex::Regex;

use crate::error::{Error, Result};
use crate::insn::{InsnId, InstructionList};
use crate::opcodes;

const PRIVATE_USE_BASE: u32 = 0xE000;

/// Token that matches any real instruction.
pub const WILDCARD: &str = "ANY";

fn opcode_char(opcode: u8) -> char {
    std::char::from_u32(PRIVATE_USE_BASE + opcode as u32).unwrap_or(char::REPLACEMENT_CHARACTER)
}

#[derive(Debug, Clone)]
pub struct InsnMatcher {
    pattern: String,
    regex: Regex,
}

impl InsnMatcher {
    /// Compiles a pattern. Unknown mnemonics and malformed regex syntax are rejected.
    pub fn compile(pattern: &str) -> Result<InsnMatcher> {
        let invalid = |token: &str| Error::InvalidPattern {
            pattern: pattern.to_string(),
            token: token.to_string(),
        };

        let mut expanded = String::with_capacity(pattern.len() * 2);
        let mut chars = pattern.char_indices().peekable();
        while let Some((start, c)) = chars.next() {
            if c.is_whitespace() {
                continue;
            }
            if !is_identifier_char(c) {
                expanded.push(c);
                continue;
            }
            let mut end = start + c.len_utf8();
            while let Some((pos, next)) = chars.peek().copied() {
                if !is_identifier_char(next) {
                    break;
                }
                end = pos + next.len_utf8();
                chars.next();
            }
            let token = &pattern[start..end];
            if token == WILDCARD {
                expanded.push('.');
            } else if let Some(opcode) = opcodes::by_name(token) {
                expanded.push(opcode_char(opcode));
            } else if let Some(group) = opcodes::group(token) {
                expanded.push('[');
                expanded.extend(group.iter().map(|opcode| opcode_char(*opcode)));
                expanded.push(']');
            } else {
                return Err(invalid(token));
            }
        }

        let regex = Regex::new(&expanded).map_err(|err| invalid(&err.to_string()))?;
        Ok(InsnMatcher {
            pattern: pattern.to_string(),
            regex,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Every non-empty, non-overlapping run of real instructions matching the
    /// pattern, in list order. Pseudo instructions are skipped and never appear
    /// in a run.
    pub fn matches(&self, list: &InstructionList) -> Vec<Vec<InsnId>> {
        let mut text = String::with_capacity(list.len() * 3);
        let mut offsets = Vec::with_capacity(list.len());
        let mut ids = Vec::with_capacity(list.len());
        for id in list.iter() {
            if let Some(opcode) = list.get(id).opcode() {
                offsets.push(text.len());
                ids.push(id);
                text.push(opcode_char(opcode));
            }
        }

        let index_of = |offset: usize| match offsets.binary_search(&offset) {
            Ok(index) => index,
            Err(index) => index,
        };
        self.regex
            .find_iter(&text)
            .filter(|found| !found.as_str().is_empty())
            .map(|found| ids[index_of(found.start())..index_of(found.end())].to_vec())
            .collect()
    }

    /// Like [`InsnMatcher::matches`], keeping only the runs accepted by `predicate`.
    pub fn matches_where(
        &self,
        list: &InstructionList,
        predicate: impl Fn(&InstructionList, &[InsnId]) -> bool,
    ) -> Vec<Vec<InsnId>> {
        self.matches(list)
            .into_iter()
            .filter(|run| predicate(list, run))
            .collect()
    }
}

fn is_identifier_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}
