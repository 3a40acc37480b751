//! Split text into speakable chunks for synthesis.
//!
//! Chunks end at sentence breaks where possible, then at clause breaks,
//! then at whitespace; a hard split is the last resort. No chunk is longer
//! than `max`, and no chunk except the last is shorter than `min`.
//! Sizes count Unicode scalar values.

use crate::config::{DEFAULT_MAX_CHUNK_SIZE, DEFAULT_MIN_CHUNK_SIZE};
use std::collections::VecDeque;

const SENTENCE_END: &[char] = &['.', '!', '?', '…', '。', '！', '？'];
const CLAUSE_END: &[char] = &[',', ';', ':', '—', '–', ')', '，', '；', '、'];
const CLOSERS: &[char] = &['"', '\'', '”', '’', ')', ']'];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLimits {
    pub max: usize,
    pub min: usize,
}

impl ChunkLimits {
    /// `min` is held below `max`: with equal bounds a piece one unit short
    /// of `max` could never be filled without exceeding it.
    pub fn new(max: usize, min: usize) -> Self {
        let max = max.max(1);
        Self {
            max,
            min: min.min(max - 1),
        }
    }
}

impl Default for ChunkLimits {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CHUNK_SIZE, DEFAULT_MIN_CHUNK_SIZE)
    }
}

/// Split text into sentences with whitespace collapsed.
fn sentences(text: &str) -> Vec<Vec<char>> {
    let chars: Vec<char> = text.chars().collect();
    let mut out = Vec::new();
    let mut buf: Vec<char> = Vec::new();

    let mut flush = |buf: &mut Vec<char>| {
        let sentence = normalize(buf);
        if !sentence.is_empty() {
            out.push(sentence);
        }
        buf.clear();
    };

    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '\n' {
            flush(&mut buf);
            i += 1;
            continue;
        }
        buf.push(c);
        i += 1;
        if SENTENCE_END.contains(&c) {
            while i < chars.len() && (SENTENCE_END.contains(&chars[i]) || CLOSERS.contains(&chars[i])) {
                buf.push(chars[i]);
                i += 1;
            }
            if i >= chars.len() || chars[i].is_whitespace() {
                flush(&mut buf);
            }
        }
    }
    flush(&mut buf);
    out
}

/// Collapse whitespace runs to one space and trim.
fn normalize(chars: &[char]) -> Vec<char> {
    let mut out = Vec::with_capacity(chars.len());
    for &c in chars {
        if c.is_whitespace() {
            if !out.is_empty() && out.last() != Some(&' ') {
                out.push(' ');
            }
        } else {
            out.push(c);
        }
    }
    while out.last() == Some(&' ') {
        out.pop();
    }
    out
}

/// A cut at `i` keeps `chars[..i]` and drops the space at `chars[i]`.
fn is_space_cut(chars: &[char], i: usize) -> bool {
    i > 0 && i < chars.len() && chars[i] == ' '
}

fn is_clause_cut(chars: &[char], i: usize) -> bool {
    is_space_cut(chars, i)
        && (CLAUSE_END.contains(&chars[i - 1]) || SENTENCE_END.contains(&chars[i - 1]))
}

/// Largest cut in `lo..=hi` accepted by `accept`.
fn last_cut(chars: &[char], lo: usize, hi: usize, accept: fn(&[char], usize) -> bool) -> Option<usize> {
    let hi = hi.min(chars.len().saturating_sub(1));
    if lo > hi {
        return None;
    }
    (lo..=hi).rev().find(|&i| accept(chars, i))
}

/// Split one piece at `cut`, trimming the separating space.
fn split_at(chars: Vec<char>, cut: usize) -> (Vec<char>, Vec<char>) {
    let mut head = chars;
    let mut tail = head.split_off(cut);
    while head.last() == Some(&' ') {
        head.pop();
    }
    let skip = tail.iter().take_while(|c| **c == ' ').count();
    tail.drain(..skip);
    (head, tail)
}

/// Break a sentence longer than `max` into pieces of at most `max`. Every
/// piece but the last is at least `min` long.
fn split_long(mut sentence: Vec<char>, max: usize, min: usize) -> Vec<Vec<char>> {
    let mut pieces = Vec::new();
    while sentence.len() > max {
        let cut = last_cut(&sentence, (max / 2).max(min), max, is_clause_cut)
            .or_else(|| last_cut(&sentence, min.max(1), max, is_space_cut))
            .unwrap_or(max);
        let (head, tail) = split_at(sentence, cut);
        pieces.push(head);
        sentence = tail;
    }
    if !sentence.is_empty() {
        pieces.push(sentence);
    }
    pieces
}

/// Split `text` into chunks bounded by `limits`.
pub fn split_for_speech(text: &str, limits: ChunkLimits) -> Vec<String> {
    let ChunkLimits { max, min } = ChunkLimits::new(limits.max, limits.min);

    let mut pieces: VecDeque<Vec<char>> = sentences(text)
        .into_iter()
        .flat_map(|s| split_long(s, max, min))
        .collect();
    let mut chunks: Vec<Vec<char>> = Vec::new();
    let mut current: Vec<char> = Vec::new();

    while let Some(piece) = pieces.pop_front() {
        if current.is_empty() {
            current = piece;
            continue;
        }
        if current.len() + 1 + piece.len() <= max {
            current.push(' ');
            current.extend(piece);
            continue;
        }

        let room = max.saturating_sub(current.len() + 1);
        // Prefer filling the chunk up to a clause break; a short chunk must
        // be filled even if that means breaking between words.
        let mut cut = last_cut(&piece, min.max(1), room, is_clause_cut);
        if cut.is_none() && current.len() < min && room > 0 {
            let lo = (min - current.len()).saturating_sub(1).max(1);
            cut = last_cut(&piece, lo, room, is_space_cut).or(Some(room));
        }

        match cut {
            Some(cut) => {
                let (head, tail) = split_at(piece, cut);
                current.push(' ');
                current.extend(head);
                chunks.push(std::mem::take(&mut current));
                if !tail.is_empty() {
                    pieces.push_front(tail);
                }
            }
            None => {
                chunks.push(std::mem::replace(&mut current, piece));
            }
        }
    }

    if !current.is_empty() {
        match chunks.last_mut() {
            Some(last) if current.len() < min && last.len() + 1 + current.len() <= max => {
                last.push(' ');
                last.extend(current);
            }
            _ => chunks.push(current),
        }
    }

    chunks.into_iter().map(|c| c.into_iter().collect()).collect()
}
