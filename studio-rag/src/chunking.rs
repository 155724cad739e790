//! Splitting documents into index-sized chunks.

use crate::vector::Metadata;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// How a document is cut before embedding. Sizes are in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ChunkStrategy {
    /// Fixed windows advancing by `size - overlap`.
    Fixed { size: usize, overlap: usize },
    /// Groups of `sentences` sentences, sharing `overlap` with the previous group.
    Sentence { sentences: usize, overlap: usize },
    /// Split on paragraphs, then lines, sentences and words until pieces fit.
    Recursive { size: usize },
}

impl Default for ChunkStrategy {
    fn default() -> Self {
        Self::Recursive { size: 1000 }
    }
}

/// A chunk ready for embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChunk {
    pub id: String,
    pub text: String,
    pub metadata: Metadata,
}

/// Cut `text` and tag every piece with its origin.
pub fn chunk_document(
    text: &str,
    source: &str,
    document_id: &str,
    strategy: ChunkStrategy,
) -> Vec<DocumentChunk> {
    chunk_text(text, strategy)
        .into_iter()
        .enumerate()
        .map(|(index, text)| {
            let mut metadata = Metadata::new();
            metadata.insert("source".into(), json!(source));
            metadata.insert("document_id".into(), json!(document_id));
            metadata.insert("chunk_index".into(), json!(index));
            DocumentChunk {
                id: format!("{document_id}-{index}"),
                text,
                metadata,
            }
        })
        .collect()
}

pub fn chunk_text(text: &str, strategy: ChunkStrategy) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }
    let chunks = match strategy {
        ChunkStrategy::Fixed { size, overlap } => fixed(text, size, overlap),
        ChunkStrategy::Sentence { sentences, overlap } => {
            by_sentences(text, sentences, overlap)
        }
        ChunkStrategy::Recursive { size } => recursive(text, size.max(1), 0),
    };
    chunks
        .into_iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect()
}

fn fixed(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let size = size.max(1);
    let step = size.saturating_sub(overlap).max(1);
    let mut out = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + size).min(chars.len());
        out.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start += step;
    }
    out
}

/// Sentence boundaries: `.`, `!` or `?` followed by whitespace or the end.
pub fn split_sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut iter = text.char_indices().peekable();
    while let Some((i, c)) = iter.next() {
        if matches!(c, '.' | '!' | '?') {
            let end = i + c.len_utf8();
            let at_boundary = iter.peek().is_none_or(|(_, next)| next.is_whitespace());
            if at_boundary {
                let sentence = text[start..end].trim();
                if !sentence.is_empty() {
                    out.push(sentence);
                }
                start = end;
            }
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}

fn by_sentences(text: &str, per_chunk: usize, overlap: usize) -> Vec<String> {
    let sentences = split_sentences(text);
    let per_chunk = per_chunk.max(1);
    let step = per_chunk.saturating_sub(overlap).max(1);
    let mut out = Vec::new();
    let mut start = 0;
    while start < sentences.len() {
        let end = (start + per_chunk).min(sentences.len());
        out.push(sentences[start..end].join(" "));
        if end == sentences.len() {
            break;
        }
        start += step;
    }
    out
}

const SEPARATORS: [&str; 4] = ["\n\n", "\n", ". ", " "];

fn recursive(text: &str, size: usize, level: usize) -> Vec<String> {
    if text.chars().count() <= size {
        return vec![text.to_string()];
    }
    let Some(sep) = SEPARATORS.get(level) else {
        return fixed(text, size, 0);
    };

    let mut out = Vec::new();
    let mut current = String::new();
    for piece in text.split(sep) {
        if piece.trim().is_empty() {
            continue;
        }
        let joined_len = current.chars().count() + sep.chars().count() + piece.chars().count();
        if !current.is_empty() && joined_len <= size {
            current.push_str(sep);
            current.push_str(piece);
            continue;
        }
        if !current.is_empty() {
            out.push(std::mem::take(&mut current));
        }
        if piece.chars().count() > size {
            out.extend(recursive(piece, size, level + 1));
        } else {
            current.push_str(piece);
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}
