//! Byte-level memory access built from word-sized protocol operations.
//!
//! The firmware only moves whole, aligned words. Everything here widens the
//! requested range to word boundaries, splits it into round trips the
//! transport accepts, and trims the padding back off before returning.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::device::Device;
use crate::error::Result;
use crate::link::Link;

/// Padding byte for the tail of a partial word; stands out in a hexdump.
pub const PAD_BYTE: u8 = 0xff;

/// Throttled progress callback for long transfers.
///
/// The callback receives `(done, total)` in bytes, at most once per
/// `interval`, and always once more when the transfer completes.
pub struct Progress<'a> {
    callback: Box<dyn FnMut(u64, u64) + 'a>,
    interval: Duration,
    last: Instant,
}

impl<'a> Progress<'a> {
    pub fn new(interval: Duration, callback: impl FnMut(u64, u64) + 'a) -> Self {
        Self {
            callback: Box::new(callback),
            interval,
            last: Instant::now(),
        }
    }

    pub fn update(&mut self, done: u64, total: u64) {
        let now = Instant::now();
        if now.duration_since(self.last) >= self.interval {
            self.last = now;
            (self.callback)(done, total);
        }
    }

    pub fn finish(&mut self, total: u64) {
        self.last = Instant::now();
        (self.callback)(total, total);
    }
}

/// Read `size` bytes at any alignment.
pub async fn read_block<L: Link>(
    device: &mut Device<L>,
    address: u32,
    size: u32,
) -> Result<Vec<u8>> {
    read_block_inner(device, address, size, None, None).await
}

pub async fn read_block_with_progress<L: Link>(
    device: &mut Device<L>,
    address: u32,
    size: u32,
    progress: &mut Progress<'_>,
) -> Result<Vec<u8>> {
    read_block_inner(device, address, size, None, Some(progress)).await
}

/// Like [`read_block`], but stops after `max_round_trips` block reads.
///
/// The result is shorter than `size` when the cap was hit.
pub async fn read_block_limited<L: Link>(
    device: &mut Device<L>,
    address: u32,
    size: u32,
    max_round_trips: usize,
) -> Result<Vec<u8>> {
    read_block_inner(device, address, size, Some(max_round_trips), None).await
}

async fn read_block_inner<L: Link>(
    device: &mut Device<L>,
    address: u32,
    size: u32,
    max_round_trips: Option<usize>,
    progress: Option<&mut Progress<'_>>,
) -> Result<Vec<u8>> {
    if size == 0 {
        return Ok(Vec::new());
    }
    // Half-open [address, end), widened to whole words.
    let end = address.wrapping_add(size);
    let word_address = address & !3;
    let word_end = end.wrapping_add(3) & !3;
    let word_size = word_end.wrapping_sub(word_address);

    let block =
        read_word_aligned(device, word_address, word_size, max_round_trips, progress).await?;

    let begin = (address - word_address) as usize;
    let end = (begin + size as usize).min(block.len());
    Ok(block.get(begin..end).map(<[u8]>::to_vec).unwrap_or_default())
}

async fn read_word_aligned<L: Link>(
    device: &mut Device<L>,
    address: u32,
    size: u32,
    max_round_trips: Option<usize>,
    mut progress: Option<&mut Progress<'_>>,
) -> Result<Vec<u8>> {
    let max_words = device.config().max_block_words.max(1);
    let mut data = Vec::with_capacity(size as usize);
    let mut offset = 0u32;
    let mut round_trips = 0usize;

    while offset < size {
        if max_round_trips.is_some_and(|max| round_trips >= max) {
            debug!(address, offset, size, "round trip cap reached");
            break;
        }
        let wordcount = ((size - offset) / 4).min(max_words);
        data.extend(device.read_block(address + offset, wordcount).await?);
        offset += 4 * wordcount;
        round_trips += 1;
        if let Some(progress) = progress.as_deref_mut() {
            progress.update(offset as u64, size as u64);
        }
    }
    if let Some(progress) = progress {
        progress.finish(size as u64);
    }
    Ok(data)
}

/// Write `words` one `poke` at a time.
pub async fn poke_words<L: Link>(
    device: &mut Device<L>,
    address: u32,
    words: &[u32],
    mut progress: Option<&mut Progress<'_>>,
) -> Result<()> {
    let total = 4 * words.len() as u64;
    for (i, word) in words.iter().enumerate() {
        device.poke(address + 4 * i as u32, *word).await?;
        if let Some(progress) = progress.as_deref_mut() {
            progress.update(4 * (i as u64 + 1), total);
        }
    }
    if let Some(progress) = progress {
        progress.finish(total);
    }
    Ok(())
}

/// Pack little-endian words, padding a partial last word with `pad`.
pub fn words_from_bytes(bytes: &[u8], pad: u8) -> Vec<u32> {
    bytes
        .chunks(4)
        .map(|chunk| {
            let mut word = [pad; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            u32::from_le_bytes(word)
        })
        .collect()
}

pub async fn poke_words_from_bytes<L: Link>(
    device: &mut Device<L>,
    address: u32,
    bytes: &[u8],
) -> Result<()> {
    poke_words(device, address, &words_from_bytes(bytes, PAD_BYTE), None).await
}

/// Fill `wordcount` words with `word`, using the byte fill when every byte
/// of the pattern is the same.
pub async fn fill<L: Link>(
    device: &mut Device<L>,
    address: u32,
    word: u32,
    wordcount: u32,
) -> Result<()> {
    let [b, rest @ ..] = word.to_le_bytes();
    if rest.iter().all(|x| *x == b) && address & 3 == 0 {
        device.fill_bytes(address, b, 4 * wordcount).await
    } else {
        device.fill_words(address, word, wordcount).await
    }
}

/// One hit from [`search_block`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    pub address: u32,
    pub before: Vec<u8>,
    pub after: Vec<u8>,
}

/// Lazily yields matches over a block that has already been read.
pub struct SearchMatches {
    block: Vec<u8>,
    base: u32,
    pattern: Vec<u8>,
    context: usize,
    offset: usize,
}

impl Iterator for SearchMatches {
    type Item = Match;

    fn next(&mut self) -> Option<Match> {
        if self.pattern.is_empty() {
            return None;
        }
        let len = self.pattern.len();
        let found = self
            .block
            .get(self.offset..)?
            .windows(len)
            .position(|w| w == self.pattern.as_slice())?;
        let at = self.offset + found;
        self.offset = at + len;
        Some(Match {
            address: self.base + at as u32,
            before: self.block[at.saturating_sub(self.context)..at].to_vec(),
            after: self.block[at + len..(at + len + self.context).min(self.block.len())].to_vec(),
        })
    }
}

/// Read `[address, address + size)` once, then search it for `pattern`.
///
/// Matches don't overlap. Each carries up to `context` bytes on either side.
pub async fn search_block<L: Link>(
    device: &mut Device<L>,
    address: u32,
    size: u32,
    pattern: &[u8],
    context: usize,
) -> Result<SearchMatches> {
    let block = read_block(device, address, size).await?;
    Ok(SearchMatches {
        block,
        base: address,
        pattern: pattern.to_vec(),
        context,
        offset: 0,
    })
}

/// Sixteen bytes per line: address, hex, printable ASCII.
pub fn hexdump(data: &[u8], address: u32) -> String {
    let mut out = String::new();
    for (i, chunk) in data.chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
        let ascii: String = chunk
            .iter()
            .map(|&b| if (0x20..0x7f).contains(&b) { b as char } else { '.' })
            .collect();
        out.push_str(&format!(
            "{:08x}  {:<48}  {}\n",
            address.wrapping_add(16 * i as u32),
            hex.join(" "),
            ascii
        ));
    }
    out
}
