//! A synchronized session with the backdoor firmware.
//!
//! [`Device`] owns a [`Link`], frames [`Command`]s onto it, validates every
//! reply and hides transient failures behind a resynchronise-and-retry loop.
//! All remote operations take `&mut self`, so a session can never have two
//! commands in flight.

use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{debug, trace, warn};

use crate::config::TransportConfig;
use crate::error::{Error, Result};
use crate::link::Link;
use crate::protocol::{Command, Opcode, PROBE, Reply};

/// How much recent line noise the handshake keeps for error reporting.
const SIGNATURE_WINDOW: usize = 256;

pub struct Device<L: Link> {
    link: L,
    config: TransportConfig,
    synchronized: bool,
    /// Tail of whatever the handshake last received.
    last_seen: Vec<u8>,
}

impl<L: Link> Device<L> {
    /// Wrap `link` and run the handshake.
    #[tracing::instrument(skip_all)]
    pub async fn open(link: L, config: TransportConfig) -> Result<Self> {
        let mut device = Self {
            link,
            config,
            synchronized: false,
            last_seen: Vec::new(),
        };
        device.synchronize().await?;
        Ok(device)
    }

    pub fn is_synchronized(&self) -> bool {
        self.synchronized
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Bytes seen during the most recent handshake, signature included.
    pub fn signature(&self) -> &[u8] {
        &self.last_seen
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// Probe until the firmware answers with its signature, then drain the line.
    #[tracing::instrument(skip(self))]
    pub async fn synchronize(&mut self) -> Result<()> {
        self.synchronized = false;
        for attempt in 1..=self.config.sync_attempts {
            self.link.send(&[PROBE]).await?;
            if self.wait_for_signature().await? {
                self.drain().await?;
                self.synchronized = true;
                debug!(attempt, "synchronized");
                return Ok(());
            }
            trace!(attempt, "no signature yet");
            sleep(self.config.sync_delay).await;
        }
        Err(Error::Synchronization {
            attempts: self.config.sync_attempts,
            last_seen: String::from_utf8_lossy(&self.last_seen).into_owned(),
        })
    }

    async fn wait_for_signature(&mut self) -> Result<bool> {
        let deadline = Instant::now() + self.config.timeout;
        let mut buf = [0u8; 64];
        self.last_seen.clear();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            let n = self.link.receive(&mut buf, remaining).await?;
            if n == 0 {
                return Ok(false);
            }
            self.last_seen.extend_from_slice(&buf[..n]);
            if contains(&self.last_seen, &self.config.signature) {
                return Ok(true);
            }
            if self.last_seen.len() > SIGNATURE_WINDOW {
                let excess = self.last_seen.len() - SIGNATURE_WINDOW;
                self.last_seen.drain(..excess);
            }
        }
    }

    /// Discard input until the line has been quiet for `drain_timeout`.
    pub async fn drain(&mut self) -> Result<usize> {
        let mut buf = [0u8; 256];
        let mut total = 0;
        loop {
            let n = self.link.receive(&mut buf, self.config.drain_timeout).await?;
            if n == 0 {
                if total > 0 {
                    trace!(total, "drained");
                }
                return Ok(total);
            }
            total += n;
        }
    }

    /// Run one command with the retry policy: a transient failure marks the
    /// session unsynchronized, and the next attempt starts with a handshake.
    async fn transact(&mut self, command: Command) -> Result<Reply> {
        let attempts = self.config.retry_limit.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            if !self.synchronized {
                self.synchronize().await?;
            }
            match self.round_trip(&command).await {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_transient() => {
                    self.synchronized = false;
                    if attempt >= attempts {
                        return Err(Error::Communication {
                            opcode: command.opcode(),
                            address: command.address(),
                            attempts,
                            source: Box::new(e),
                        });
                    }
                    warn!(attempt, "{e}, resynchronizing");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn round_trip(&mut self, command: &Command) -> Result<Reply> {
        trace!(?command, "sending");
        let frame = command.encode(&self.config.opcodes);
        self.link.send(&frame).await?;

        let timeout = match command {
            Command::Blx { .. } => self.config.blx_timeout,
            _ => self.config.timeout,
        };
        let mut reply = vec![0u8; command.reply_len()];
        self.read_exact(&mut reply, timeout, command).await?;
        command.decode(&reply)
    }

    async fn read_exact(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
        command: &Command,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut filled = 0;
        while filled < buf.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let n = if remaining.is_zero() {
                0
            } else {
                self.link.receive(&mut buf[filled..], remaining).await?
            };
            if n == 0 {
                return Err(Error::Timeout {
                    opcode: command.opcode(),
                    address: command.address(),
                    wanted: buf.len() - filled,
                });
            }
            filled += n;
        }
        Ok(())
    }

    pub async fn peek(&mut self, address: u32) -> Result<u32> {
        check_word_aligned(address)?;
        match self.transact(Command::Peek { address }).await? {
            Reply::Word(word) => Ok(word),
            _ => Err(Error::MismatchedReply(Opcode::Peek)),
        }
    }

    pub async fn poke(&mut self, address: u32, word: u32) -> Result<()> {
        check_word_aligned(address)?;
        self.transact(Command::Poke { address, word }).await?;
        Ok(())
    }

    pub async fn peek_byte(&mut self, address: u32) -> Result<u8> {
        match self.transact(Command::PeekByte { address }).await? {
            Reply::Byte(byte) => Ok(byte),
            _ => Err(Error::MismatchedReply(Opcode::PeekByte)),
        }
    }

    pub async fn poke_byte(&mut self, address: u32, byte: u8) -> Result<()> {
        self.transact(Command::PokeByte { address, byte }).await?;
        Ok(())
    }

    /// Call the function at `address` with `r0`, returning `(r0, r1)`.
    ///
    /// Set the low bit of `address` for Thumb code.
    pub async fn blx(&mut self, address: u32, r0: u32) -> Result<(u32, u32)> {
        match self.transact(Command::Blx { address, r0 }).await? {
            Reply::Registers { r0, r1 } => Ok((r0, r1)),
            _ => Err(Error::MismatchedReply(Opcode::Blx)),
        }
    }

    /// One round trip of at most `max_block_words` words.
    ///
    /// Use [`memory::read_block`](crate::memory::read_block) for arbitrary ranges.
    pub async fn read_block(&mut self, address: u32, wordcount: u32) -> Result<Vec<u8>> {
        check_word_aligned(address)?;
        if wordcount == 0 {
            return Ok(Vec::new());
        }
        if wordcount > self.config.max_block_words {
            return Err(Error::BlockTooLarge {
                wordcount,
                max: self.config.max_block_words,
            });
        }
        match self.transact(Command::ReadBlock { address, wordcount }).await? {
            Reply::Block(data) => Ok(data),
            _ => Err(Error::MismatchedReply(Opcode::ReadBlock)),
        }
    }

    pub async fn fill_words(&mut self, address: u32, pattern: u32, wordcount: u32) -> Result<()> {
        check_word_aligned(address)?;
        if wordcount == 0 {
            return Ok(());
        }
        self.transact(Command::FillWords {
            address,
            pattern,
            wordcount,
        })
        .await?;
        Ok(())
    }

    pub async fn fill_bytes(&mut self, address: u32, pattern: u8, bytecount: u32) -> Result<()> {
        if bytecount == 0 {
            return Ok(());
        }
        self.transact(Command::FillBytes {
            address,
            pattern,
            bytecount,
        })
        .await?;
        Ok(())
    }

    /// Hand control back to the stock firmware and close the link.
    #[tracing::instrument(skip(self))]
    pub async fn exit(mut self) -> Result<()> {
        self.transact(Command::Exit).await?;
        self.synchronized = false;
        self.link.close().await
    }
}

fn check_word_aligned(address: u32) -> Result<()> {
    if address & 3 != 0 {
        return Err(Error::Alignment {
            address,
            required: 4,
        });
    }
    Ok(())
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}
