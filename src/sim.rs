//! An in-process stand-in for the backdoor firmware.
//!
//! [`SimulatedTarget`] speaks the exact byte protocol the real stub does, so
//! a [`Device`](crate::device::Device) can't tell the difference. Behind it sits
//! sparse word memory with an optional read-only flash range and a model of
//! the overlay window hardware. Every memory write and every executed command
//! frame is recorded so tests can assert on traffic, and replies can be
//! corrupted on demand to exercise the retry path.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::Range;
use std::time::Duration;

use tracing::trace;

use crate::error::{Error, Result};
use crate::link::Link;
use crate::memmap::{
    OVERLAY_BASE, OVERLAY_CONTROL, OVERLAY_ENABLE_A, OVERLAY_ENABLE_B, OVERLAY_LIMIT,
    OVERLAY_MAX_WORDS,
};
use crate::protocol::{EXIT_ACK, FRAME_HEADER, Opcode, OpcodeTable, SIGNATURE, le32};

/// Code the simulated CPU "runs" on `blx`: gets memory and r0, returns (r0, r1).
pub type Gadget = Box<dyn FnMut(&mut SimMemory, u32) -> (u32, u32)>;

/// Target address space as the firmware sees it.
pub struct SimMemory {
    words: BTreeMap<u32, u32>,
    flash: Range<u32>,
    overlay: Vec<u32>,
    writes: Vec<(u32, u32)>,
}

impl SimMemory {
    fn new() -> Self {
        Self {
            words: BTreeMap::new(),
            flash: 0..0,
            overlay: vec![0; OVERLAY_MAX_WORDS as usize],
            writes: Vec::new(),
        }
    }

    fn overlay_index(&self, address: u32) -> Option<usize> {
        let control = self.words.get(&OVERLAY_CONTROL).copied().unwrap_or(0);
        let enable = OVERLAY_ENABLE_A | OVERLAY_ENABLE_B;
        if control & enable != enable {
            return None;
        }
        let base = self.words.get(&OVERLAY_BASE).copied().unwrap_or(u32::MAX);
        let limit = self.words.get(&OVERLAY_LIMIT).copied().unwrap_or(0);
        (base..=limit)
            .contains(&address)
            .then(|| ((address - base) / 4) as usize % self.overlay.len())
    }

    pub fn read_word(&self, address: u32) -> u32 {
        let address = address & !3;
        match self.overlay_index(address) {
            Some(i) => self.overlay[i],
            None => self.words.get(&address).copied().unwrap_or(0),
        }
    }

    /// A CPU store: lands in the overlay if mapped, is dropped on flash.
    pub fn write_word(&mut self, address: u32, value: u32) {
        let address = address & !3;
        self.writes.push((address, value));
        if let Some(i) = self.overlay_index(address) {
            self.overlay[i] = value;
        } else if !self.flash.contains(&address) {
            self.words.insert(address, value);
        }
    }

    pub fn read_byte(&self, address: u32) -> u8 {
        (self.read_word(address) >> (8 * (address & 3))) as u8
    }

    pub fn write_byte(&mut self, address: u32, byte: u8) {
        let shift = 8 * (address & 3);
        let word = self.read_word(address) & !(0xff << shift) | (byte as u32) << shift;
        self.write_word(address, word);
    }

    /// Place bytes in backing memory, flash included, without logging a write.
    pub fn load(&mut self, address: u32, bytes: &[u8]) {
        for (i, byte) in bytes.iter().enumerate() {
            let a = address + i as u32;
            let shift = 8 * (a & 3);
            let slot = self.words.entry(a & !3).or_insert(0);
            *slot = *slot & !(0xff << shift) | (*byte as u32) << shift;
        }
    }

    /// Every store the CPU made, as `(word address, value)`, oldest first.
    pub fn writes(&self) -> &[(u32, u32)] {
        &self.writes
    }
}

pub struct SimulatedTarget {
    memory: SimMemory,
    gadgets: HashMap<u32, Gadget>,
    opcodes: OpcodeTable,
    signature: Vec<u8>,
    rx: Vec<u8>,
    tx: VecDeque<u8>,
    corrupt: u32,
    mute: bool,
    exited: bool,
    closed: bool,
    frames: HashMap<Opcode, usize>,
    signatures_sent: usize,
}

impl Default for SimulatedTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedTarget {
    pub fn new() -> Self {
        Self {
            memory: SimMemory::new(),
            gadgets: HashMap::new(),
            opcodes: OpcodeTable::default(),
            signature: SIGNATURE.to_vec(),
            rx: Vec::new(),
            tx: VecDeque::new(),
            corrupt: 0,
            mute: false,
            exited: false,
            closed: false,
            frames: HashMap::new(),
            signatures_sent: 0,
        }
    }

    pub fn memory(&self) -> &SimMemory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut SimMemory {
        &mut self.memory
    }

    pub fn read_word(&self, address: u32) -> u32 {
        self.memory.read_word(address)
    }

    /// Word-aligned range where stores are silently ignored.
    pub fn set_flash(&mut self, range: Range<u32>) {
        self.memory.flash = range;
    }

    /// Register code to run when `blx` targets `address` (Thumb bit included).
    /// Unregistered addresses return `(r0, 0)`.
    pub fn add_gadget(
        &mut self,
        address: u32,
        gadget: impl FnMut(&mut SimMemory, u32) -> (u32, u32) + 'static,
    ) {
        self.gadgets.insert(address, Box::new(gadget));
    }

    /// Run the gadget at `address` directly, as target code branching to it would.
    pub fn call(&mut self, address: u32, r0: u32) -> Option<(u32, u32)> {
        let gadget = self.gadgets.get_mut(&address)?;
        Some(gadget(&mut self.memory, r0))
    }

    /// Flip a bit in the check word of the next `count` command replies.
    pub fn corrupt_next_replies(&mut self, count: u32) {
        self.corrupt = count;
    }

    /// A muted target swallows everything and never answers.
    pub fn set_mute(&mut self, mute: bool) {
        self.mute = mute;
    }

    /// Queue bytes as if the firmware had printed them earlier.
    pub fn push_noise(&mut self, bytes: &[u8]) {
        self.tx.extend(bytes);
    }

    /// Number of complete command frames executed for `opcode`.
    pub fn frames(&self, opcode: Opcode) -> usize {
        self.frames.get(&opcode).copied().unwrap_or(0)
    }

    pub fn signatures_sent(&self) -> usize {
        self.signatures_sent
    }

    fn emit(&mut self, bytes: &[u8]) {
        if !self.mute {
            self.tx.extend(bytes);
        }
    }

    fn emit_signature(&mut self) {
        if !self.mute {
            self.signatures_sent += 1;
            let signature = self.signature.clone();
            self.tx.extend(signature);
        }
    }

    /// Consume as many complete frames from `rx` as are available.
    fn process(&mut self) {
        loop {
            if self.exited {
                self.rx.clear();
                return;
            }
            let Some(&first) = self.rx.first() else {
                return;
            };
            if first != FRAME_HEADER[0] {
                self.rx.remove(0);
                self.emit_signature();
                continue;
            }
            if self.rx.len() < 3 {
                return;
            }
            let opcode = match (self.rx[1], self.opcodes.lookup(self.rx[2])) {
                (header, Some(opcode)) if header == FRAME_HEADER[1] => opcode,
                _ => {
                    self.rx.remove(0);
                    self.emit_signature();
                    continue;
                }
            };
            if opcode == Opcode::Exit {
                self.rx.drain(..3);
                *self.frames.entry(opcode).or_default() += 1;
                self.exited = true;
                self.emit(&[EXIT_ACK]);
                continue;
            }
            let needed = 7 + 4 * payload_words(opcode);
            if self.rx.len() < needed {
                return;
            }
            let frame: Vec<u8> = self.rx.drain(..needed).collect();
            let address = le32(&frame[3..7]);
            let payload: Vec<u32> = frame[7..].chunks_exact(4).map(le32).collect();
            *self.frames.entry(opcode).or_default() += 1;
            let mut reply = self.execute(opcode, address, &payload);
            if self.corrupt > 0 {
                self.corrupt -= 1;
                if let Some(last) = reply.last_mut() {
                    *last ^= 0x40;
                }
            }
            self.emit(&reply);
        }
    }

    fn execute(&mut self, opcode: Opcode, address: u32, payload: &[u32]) -> Vec<u8> {
        trace!(?opcode, address, ?payload, "simulated frame");
        let mem = &mut self.memory;
        let mut reply = Vec::new();
        let check = match opcode {
            Opcode::Peek => {
                let word = mem.read_word(address);
                reply.extend_from_slice(&word.to_le_bytes());
                word ^ address
            }
            Opcode::Poke => {
                mem.write_word(address, payload[0]);
                payload[0] ^ address
            }
            Opcode::PeekByte => {
                let byte = mem.read_byte(address);
                reply.push(byte);
                byte as u32 ^ address
            }
            Opcode::PokeByte => {
                mem.write_byte(address, payload[0] as u8);
                payload[0] ^ address
            }
            Opcode::Blx => {
                let r0 = payload[0];
                let (r0, r1) = match self.gadgets.get_mut(&address) {
                    Some(gadget) => gadget(mem, r0),
                    None => (r0, 0),
                };
                reply.extend_from_slice(&r0.to_le_bytes());
                reply.extend_from_slice(&r1.to_le_bytes());
                r0 ^ address
            }
            Opcode::ReadBlock => {
                let mut last = 0;
                for i in 0..payload[0] {
                    last = mem.read_word(address.wrapping_add(4 * i));
                    reply.extend_from_slice(&last.to_le_bytes());
                }
                last ^ address.wrapping_add(4 * payload[0])
            }
            Opcode::FillWords => {
                let (pattern, count) = (payload[0], payload[1]);
                for i in 0..count {
                    mem.write_word(address.wrapping_add(4 * i), pattern);
                }
                pattern ^ address.wrapping_add(4 * count)
            }
            Opcode::FillBytes => {
                let (pattern, count) = (payload[0], payload[1]);
                for i in 0..count {
                    mem.write_byte(address.wrapping_add(i), pattern as u8);
                }
                pattern ^ address.wrapping_add(count)
            }
            Opcode::Exit => return vec![EXIT_ACK],
        };
        reply.extend_from_slice(&check.to_le_bytes());
        reply
    }
}

fn payload_words(opcode: Opcode) -> usize {
    match opcode {
        Opcode::Peek | Opcode::PeekByte | Opcode::Exit => 0,
        Opcode::Poke | Opcode::PokeByte | Opcode::Blx | Opcode::ReadBlock => 1,
        Opcode::FillWords | Opcode::FillBytes => 2,
    }
}

impl Link for SimulatedTarget {
    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::LinkClosed);
        }
        self.rx.extend_from_slice(bytes);
        self.process();
        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        if self.closed {
            return Err(Error::LinkClosed);
        }
        let n = buf.len().min(self.tx.len());
        for (slot, byte) in buf.iter_mut().zip(self.tx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_shadows_flash_only_when_both_bits_are_set() {
        let mut mem = SimMemory::new();
        mem.flash = 0x1000..0x2000;
        mem.load(0x1000, &[0x00, 0xbf, 0x00, 0xbf]);
        mem.write_word(0x1000, 0x1234);
        assert_eq!(mem.read_word(0x1000), 0xbf00bf00);

        mem.write_word(OVERLAY_BASE, 0x1000);
        mem.write_word(OVERLAY_LIMIT, 0x1007);
        mem.write_word(OVERLAY_CONTROL, OVERLAY_ENABLE_A);
        assert_eq!(mem.read_word(0x1000), 0xbf00bf00);
        mem.write_word(OVERLAY_CONTROL, OVERLAY_ENABLE_A | OVERLAY_ENABLE_B);
        assert_eq!(mem.read_word(0x1000), 0);
        mem.write_word(0x1004, 0xbebe);
        assert_eq!(mem.read_byte(0x1004), 0xbe);
        assert_eq!(mem.read_word(0x1008), 0);
    }

    #[tokio::test]
    async fn stray_bytes_provoke_the_signature() {
        let mut target = SimulatedTarget::new();
        target.send(b"\n").await.unwrap();
        let mut buf = [0u8; 64];
        let n = target.receive(&mut buf, Duration::ZERO).await.unwrap();
        assert_eq!(&buf[..n], SIGNATURE);
        assert_eq!(target.signatures_sent(), 1);
    }

    #[tokio::test]
    async fn frames_may_arrive_in_pieces() {
        let mut target = SimulatedTarget::new();
        target.send(&[0x55, 0x00, 0xe1, 0x00]).await.unwrap();
        assert_eq!(target.frames(Opcode::Poke), 0);
        target.send(&[0x00, 0x00, 0x00, 7, 0, 0, 0]).await.unwrap();
        assert_eq!(target.frames(Opcode::Poke), 1);
        assert_eq!(target.read_word(0), 7);
    }
}
