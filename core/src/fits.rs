//! Minimal FITS primary-header reader.
//!
//! A FITS file starts with a primary header of 2880-byte blocks, each
//! holding 36 80-byte card images: an 8-character keyword, a `= ` value
//! indicator, and a value field optionally followed by a `/` comment.
//! String values are single-quoted with `''` as the escape. The header ends
//! at the `END` keyword. This reader stops there; data units are never read.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::error::{DnaError, Result};

const BLOCK_SIZE: usize = 2880;
const CARD_SIZE: usize = 80;

/// Headers larger than this are not exposure files we produce.
const MAX_HEADER_BLOCKS: usize = 64;

/// Parsed primary-header keyword/value pairs.
#[derive(Debug, Clone, Default)]
pub struct FitsHeader {
    cards: Vec<(String, String)>,
}

impl FitsHeader {
    /// Value for `keyword`, if present.
    pub fn get(&self, keyword: &str) -> Option<&str> {
        self.cards
            .iter()
            .find(|(key, _)| key == keyword)
            .map(|(_, value)| value.as_str())
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }
}

/// Read the primary header of the FITS file at `path`.
pub fn read_primary_header(path: &Path) -> Result<FitsHeader> {
    let mut file = File::open(path)?;
    let mut header = FitsHeader::default();
    let mut block = [0u8; BLOCK_SIZE];

    for _ in 0..MAX_HEADER_BLOCKS {
        file.read_exact(&mut block).map_err(|_| DnaError::Header {
            path: path.to_path_buf(),
            message: "truncated header block".to_string(),
        })?;
        for card in block.chunks_exact(CARD_SIZE) {
            let keyword = String::from_utf8_lossy(&card[..8]).trim_end().to_string();
            if keyword == "END" {
                return Ok(header);
            }
            if keyword.is_empty() || keyword == "COMMENT" || keyword == "HISTORY" {
                continue;
            }
            // Cards without the `= ` indicator carry no value.
            if &card[8..10] != b"= " {
                continue;
            }
            let value = parse_value(&card[10..]);
            header.cards.push((keyword, value));
        }
    }

    Err(DnaError::Header {
        path: path.to_path_buf(),
        message: format!("no END card within {MAX_HEADER_BLOCKS} blocks"),
    })
}

/// Extract the value field from the tail of a card image.
fn parse_value(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let trimmed = text.trim_start();

    if let Some(rest) = trimmed.strip_prefix('\'') {
        // Quoted string; '' is a literal quote.
        let mut value = String::new();
        let mut chars = rest.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '\'' {
                if chars.peek() == Some(&'\'') {
                    chars.next();
                    value.push('\'');
                } else {
                    break;
                }
            } else {
                value.push(c);
            }
        }
        // FITS pads short strings with trailing blanks inside the quotes.
        value.trim_end().to_string()
    } else {
        match trimmed.split_once('/') {
            Some((value, _comment)) => value.trim().to_string(),
            None => trimmed.trim_end().to_string(),
        }
    }
}
