//! rfaccess-dummy - In-memory MIFARE Classic emulator for testing
//!
//! This crate provides an emulated proximity card implementing
//! [`TagTransport`]. It enforces keys and access conditions like a real
//! card and can be told to misbehave (leave the field, tear a write, hold
//! stuck bits) so the programming protocol can be exercised without
//! hardware.
//!
//! Clones of an [`EmulatedCard`] share the same memory, so a test can hand
//! one clone to the code under test and inspect the card through another.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use rfaccess_core::error::TransportError;
use rfaccess_core::tag::access::{AccessBits, COND_READ_ONLY, COND_TRAILER_TRANSPORT, TRANSPORT_ACCESS};
use rfaccess_core::tag::{
    BlockAccess, CardGeometry, CardSize, KeyKind, SectorKey, TagTechnology, TagTransport, BLOCK_SIZE,
    KEY_LEN, TRANSPORT_KEY,
};

/// NAK code a MIFARE Classic answers with when an operation is refused
pub const NAK_NOT_ALLOWED: u8 = 0x04;

const KEY_B_OFFSET: usize = 10;
const GENERAL_PURPOSE_BYTE: u8 = 0x69;

/// Configuration for the emulated card
#[derive(Debug, Clone)]
pub struct CardConfig {
    /// Memory size
    pub size: CardSize,
    /// 4-byte UID
    pub uid: [u8; 4],
    /// Technology reported to the reader
    pub technology: TagTechnology,
    /// Sector/block counts reported instead of the real ones
    pub reported_geometry: Option<(usize, usize)>,
}

impl Default for CardConfig {
    fn default() -> Self {
        Self {
            size: CardSize::Classic1K,
            uid: [0x04, 0xA2, 0x19, 0x7E],
            technology: TagTechnology::MifareClassic,
            reported_geometry: None,
        }
    }
}

/// Misbehaviour to inject into the emulated card
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Leave the field after this many more radio operations
    RemoveAfter {
        /// Operations (authenticate/read/write) that still succeed
        ops: usize,
    },
    /// Tear the nth write (1-based): half the block is written, then the
    /// card leaves the field
    RemoveOnWrite {
        /// Write call that fails
        nth: usize,
    },
    /// Bits that stay set in a block whatever is written to it
    StuckBits {
        /// Affected block
        block: u16,
        /// Bits forced to 1
        mask: [u8; BLOCK_SIZE],
    },
}

/// One radio operation seen by the card
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardOp {
    /// Session claimed
    Connect,
    /// Key presented
    Authenticate {
        /// Sector addressed
        sector: u8,
        /// Key type presented
        kind: KeyKind,
        /// Whether the key was accepted
        accepted: bool,
    },
    /// Block read
    Read(u16),
    /// Block write
    Write(u16),
    /// Session released
    Close,
}

/// Tracks how many card sessions hold the radio
///
/// Share one monitor between several cards to check that no two sessions
/// are ever open at once.
#[derive(Debug, Default)]
pub struct RadioMonitor {
    open: AtomicUsize,
    peak: AtomicUsize,
    sessions: AtomicUsize,
}

impl RadioMonitor {
    /// Create a new monitor
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Sessions open right now
    pub fn open_sessions(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Highest number of sessions that were open at the same time
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Sessions opened so far
    pub fn sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    fn claim(&self) {
        let now = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.sessions.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

struct CardMemory {
    blocks: Vec<[u8; BLOCK_SIZE]>,
    present: bool,
    connected: bool,
    /// Sector and key type of the current authentication
    auth: Option<(u8, KeyKind)>,
    faults: Vec<Fault>,
    ops: Vec<CardOp>,
    writes: usize,
}

/// Emulated MIFARE Classic card
#[derive(Clone)]
pub struct EmulatedCard {
    config: CardConfig,
    geometry: CardGeometry,
    uid: Vec<u8>,
    memory: Arc<Mutex<CardMemory>>,
    radio: Arc<RadioMonitor>,
}

impl EmulatedCard {
    /// Create a factory-fresh card of the given size
    pub fn new(size: CardSize) -> Self {
        Self::with_config(CardConfig {
            size,
            ..CardConfig::default()
        })
    }

    /// Create a factory-fresh card
    ///
    /// Every sector trailer holds the transport keys and access bits; block 0
    /// holds the UID and its check byte.
    pub fn with_config(config: CardConfig) -> Self {
        let geometry = CardGeometry::new(config.size);
        let mut blocks = vec![[0u8; BLOCK_SIZE]; geometry.block_count()];

        let uid = config.uid;
        let bcc = uid.iter().fold(0u8, |acc, b| acc ^ b);
        blocks[0][..4].copy_from_slice(&uid);
        blocks[0][4] = bcc;
        blocks[0][5] = sak(config.size);
        blocks[0][6..8].copy_from_slice(&[0x04, 0x00]);

        for sector in 0..geometry.sector_count() as u8 {
            let trailer = &mut blocks[geometry.trailer_block(sector) as usize];
            trailer[..KEY_LEN].copy_from_slice(&TRANSPORT_KEY);
            trailer[6..9].copy_from_slice(&TRANSPORT_ACCESS);
            trailer[9] = GENERAL_PURPOSE_BYTE;
            trailer[KEY_B_OFFSET..].copy_from_slice(&TRANSPORT_KEY);
        }

        Self {
            geometry,
            uid: uid.to_vec(),
            config,
            memory: Arc::new(Mutex::new(CardMemory {
                blocks,
                present: true,
                connected: false,
                auth: None,
                faults: Vec::new(),
                ops: Vec::new(),
                writes: 0,
            })),
            radio: RadioMonitor::new(),
        }
    }

    /// Load a card from a raw dump (all blocks, trailers included)
    ///
    /// Returns `None` if the length matches no card size.
    pub fn from_image(image: &[u8]) -> Option<Self> {
        let size = CardSize::from_image_len(image.len())?;
        let mut uid = [0u8; 4];
        uid.copy_from_slice(&image[..4]);
        let card = Self::with_config(CardConfig {
            size,
            uid,
            ..CardConfig::default()
        });
        {
            let mut mem = card.lock();
            for (block, chunk) in mem.blocks.iter_mut().zip(image.chunks_exact(BLOCK_SIZE)) {
                block.copy_from_slice(chunk);
            }
        }
        Some(card)
    }

    /// Use a shared radio monitor
    pub fn with_radio(mut self, radio: Arc<RadioMonitor>) -> Self {
        self.radio = radio;
        self
    }

    /// Radio monitor of this card
    pub fn radio(&self) -> Arc<RadioMonitor> {
        Arc::clone(&self.radio)
    }

    /// Configuration the card was created with
    pub fn config(&self) -> &CardConfig {
        &self.config
    }

    /// Raw dump of the whole card
    pub fn image(&self) -> Vec<u8> {
        self.lock().blocks.iter().flatten().copied().collect()
    }

    /// Contents of one block, bypassing keys and access conditions
    pub fn block(&self, block: u16) -> [u8; BLOCK_SIZE] {
        self.lock().blocks[block as usize]
    }

    /// Change the keys of a sector
    pub fn set_sector_keys(&self, sector: u8, key_a: [u8; KEY_LEN], key_b: [u8; KEY_LEN]) {
        let trailer = self.geometry.trailer_block(sector) as usize;
        let mut mem = self.lock();
        mem.blocks[trailer][..KEY_LEN].copy_from_slice(&key_a);
        mem.blocks[trailer][KEY_B_OFFSET..].copy_from_slice(&key_b);
    }

    /// Overwrite the access bytes of a sector
    pub fn set_access(&self, sector: u8, access: [u8; 3]) {
        let trailer = self.geometry.trailer_block(sector) as usize;
        self.lock().blocks[trailer][6..9].copy_from_slice(&access);
    }

    /// Make a data block permanently read-only
    pub fn lock_block(&self, block: u16) {
        let Some(sector) = self.geometry.sector_of_block(block) else {
            return;
        };
        let trailer = self.geometry.trailer_block(sector) as usize;
        let mut mem = self.lock();
        let bits = AccessBits::from_trailer(&mem.blocks[trailer])
            .unwrap_or_else(|| AccessBits::from_conditions([0, 0, 0, COND_TRAILER_TRANSPORT]));
        let blocks_in_sector = self.geometry.blocks_in_sector(sector);
        let index = (block - self.geometry.first_block(sector)) as usize;
        let group = rfaccess_core::tag::access::access_group(index, blocks_in_sector);

        let mut conditions = [0u8; 4];
        for (g, cond) in conditions.iter_mut().enumerate() {
            *cond = bits.condition(g);
        }
        conditions[group] = COND_READ_ONLY;
        mem.blocks[trailer][6..9].copy_from_slice(&AccessBits::from_conditions(conditions).encode());
    }

    /// Add a fault
    pub fn inject(&self, fault: Fault) {
        self.lock().faults.push(fault);
    }

    /// Take the card out of the field
    pub fn remove(&self) {
        self.lock().present = false;
    }

    /// Put the card back into the field
    pub fn reinsert(&self) {
        let mut mem = self.lock();
        mem.present = true;
        mem.auth = None;
    }

    /// Radio operations seen so far
    pub fn ops(&self) -> Vec<CardOp> {
        self.lock().ops.clone()
    }

    fn lock(&self) -> MutexGuard<'_, CardMemory> {
        self.memory.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Account for one radio operation and fail it if the card is gone
    fn radio_op(mem: &mut CardMemory) -> Result<(), TransportError> {
        if !mem.present || !mem.connected {
            return Err(TransportError::TagLost);
        }
        for fault in mem.faults.iter_mut() {
            if let Fault::RemoveAfter { ops } = fault {
                if *ops == 0 {
                    mem.present = false;
                    mem.auth = None;
                    log::trace!("Emulated card left the field");
                    return Err(TransportError::TagLost);
                }
                *ops -= 1;
            }
        }
        Ok(())
    }

    /// Key type holding authentication for the sector of `block`
    fn authorized(&self, mem: &CardMemory, block: u16) -> Result<(u8, KeyKind), TransportError> {
        let sector = self
            .geometry
            .sector_of_block(block)
            .ok_or(TransportError::Nak(NAK_NOT_ALLOWED))?;
        match mem.auth {
            Some((auth_sector, kind)) if auth_sector == sector => Ok((sector, kind)),
            _ => Err(TransportError::Nak(NAK_NOT_ALLOWED)),
        }
    }

    fn data_access(&self, mem: &CardMemory, sector: u8, block: u16) -> BlockAccess {
        let trailer = &mem.blocks[self.geometry.trailer_block(sector) as usize];
        match AccessBits::from_trailer(trailer) {
            Some(bits) => {
                let index = (block - self.geometry.first_block(sector)) as usize;
                bits.data_block(index, self.geometry.blocks_in_sector(sector))
            }
            // a sector with corrupt access bits is blocked for good
            None => BlockAccess::empty(),
        }
    }
}

fn sak(size: CardSize) -> u8 {
    match size {
        CardSize::Mini => 0x09,
        CardSize::Classic1K => 0x08,
        CardSize::Classic2K => 0x19,
        CardSize::Classic4K => 0x18,
    }
}

fn can_read(access: BlockAccess, kind: KeyKind) -> bool {
    match kind {
        KeyKind::A => access.contains(BlockAccess::READ_A),
        KeyKind::B => access.contains(BlockAccess::READ_B),
    }
}

impl TagTransport for EmulatedCard {
    fn technology(&self) -> TagTechnology {
        self.config.technology
    }

    fn uid(&self) -> &[u8] {
        &self.uid
    }

    fn sector_count(&self) -> usize {
        self.config
            .reported_geometry
            .map_or(self.geometry.sector_count(), |(sectors, _)| sectors)
    }

    fn block_count(&self) -> usize {
        self.config
            .reported_geometry
            .map_or(self.geometry.block_count(), |(_, blocks)| blocks)
    }

    fn connect(&mut self) -> Result<(), TransportError> {
        let mut mem = self.lock();
        if !mem.present {
            return Err(TransportError::TagLost);
        }
        if !mem.connected {
            mem.connected = true;
            self.radio.claim();
        }
        mem.auth = None;
        mem.ops.push(CardOp::Connect);
        Ok(())
    }

    fn authenticate(&mut self, sector: u8, key: &SectorKey) -> Result<bool, TransportError> {
        let mut mem = self.lock();
        Self::radio_op(&mut mem)?;
        if sector as usize >= self.geometry.sector_count() {
            return Err(TransportError::Nak(NAK_NOT_ALLOWED));
        }

        let trailer = &mem.blocks[self.geometry.trailer_block(sector) as usize];
        let stored = match key.kind {
            KeyKind::A => &trailer[..KEY_LEN],
            KeyKind::B => &trailer[KEY_B_OFFSET..],
        };
        let accepted = stored == key.bytes;

        mem.auth = accepted.then_some((sector, key.kind));
        mem.ops.push(CardOp::Authenticate {
            sector,
            kind: key.kind,
            accepted,
        });
        log::trace!("Emulated auth sector {} key {}: {}", sector, key.kind, accepted);
        Ok(accepted)
    }

    fn read_block(&mut self, block: u16) -> Result<Vec<u8>, TransportError> {
        let mut mem = self.lock();
        Self::radio_op(&mut mem)?;
        let (sector, kind) = self.authorized(&mem, block)?;
        mem.ops.push(CardOp::Read(block));

        let mut data = mem.blocks[block as usize];
        if self.geometry.is_trailer(block) {
            // key fields always read back as zeros
            data[..KEY_LEN].fill(0);
            data[KEY_B_OFFSET..].fill(0);
        } else if block != 0 && !can_read(self.data_access(&mem, sector, block), kind) {
            return Err(TransportError::Nak(NAK_NOT_ALLOWED));
        }
        Ok(data.to_vec())
    }

    fn write_block(&mut self, block: u16, data: &[u8; BLOCK_SIZE]) -> Result<(), TransportError> {
        let mut guard = self.lock();
        let mem = &mut *guard;
        Self::radio_op(mem)?;
        let (sector, kind) = self.authorized(mem, block)?;
        mem.ops.push(CardOp::Write(block));
        mem.writes += 1;

        if block == 0 {
            return Err(TransportError::Nak(NAK_NOT_ALLOWED));
        }
        if self.geometry.is_trailer(block) {
            let trailer = &mem.blocks[block as usize];
            let transport = AccessBits::from_trailer(trailer)
                .is_some_and(|bits| bits.condition(3) == COND_TRAILER_TRANSPORT);
            if !(transport && kind == KeyKind::A) {
                return Err(TransportError::Nak(NAK_NOT_ALLOWED));
            }
        } else if !self.data_access(mem, sector, block).can_write(kind) {
            return Err(TransportError::Nak(NAK_NOT_ALLOWED));
        }

        let writes = mem.writes;
        let mut stored = *data;
        for fault in &mem.faults {
            match *fault {
                Fault::RemoveOnWrite { nth } if nth == writes => {
                    let half = BLOCK_SIZE / 2;
                    mem.blocks[block as usize][..half].copy_from_slice(&data[..half]);
                    mem.present = false;
                    mem.auth = None;
                    log::trace!("Emulated card torn during write of block {}", block);
                    return Err(TransportError::Timeout);
                }
                Fault::StuckBits { block: stuck, mask } if stuck == block => {
                    for (byte, m) in stored.iter_mut().zip(mask) {
                        *byte |= m;
                    }
                }
                _ => {}
            }
        }
        mem.blocks[block as usize] = stored;
        Ok(())
    }

    fn close(&mut self) {
        let mut mem = self.lock();
        if mem.connected {
            mem.connected = false;
            mem.auth = None;
            mem.ops.push(CardOp::Close);
            self.radio.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rfaccess_core::payload::{decode_token, BlockWrite, CardPayload};
    use rfaccess_core::profile::CardProfile;
    use rfaccess_core::protocol::{program, NeverCancel, NoProgress};
    use rfaccess_core::tag::TagLink;
    use rfaccess_core::error::{Incompatibility, RejectReason};
    use rfaccess_core::ProtocolOutcome;

    const CARD_KEY: [u8; KEY_LEN] = [0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5];

    fn token_payload(token: &str) -> CardPayload {
        CardPayload::from_token(token, &CardProfile::default()).unwrap()
    }

    fn read_credential(card: &EmulatedCard) -> Result<String, rfaccess_core::payload::CredentialError> {
        let blocks: Vec<[u8; BLOCK_SIZE]> = (4..=6).map(|b| card.block(b)).collect();
        decode_token(&blocks)
    }

    fn run(card: &EmulatedCard, payload: &CardPayload) -> ProtocolOutcome {
        let mut link = TagLink::default();
        program(&mut link, card.clone(), payload, &mut NoProgress, &NeverCancel)
    }

    #[test]
    fn test_factory_card() {
        let card = EmulatedCard::new(CardSize::Classic1K);
        assert_eq!(card.image().len(), 1024);
        assert_eq!(&card.block(0)[..5], &[0x04, 0xA2, 0x19, 0x7E, 0x04 ^ 0xA2 ^ 0x19 ^ 0x7E]);
        assert_eq!(&card.block(7)[6..9], &TRANSPORT_ACCESS);
    }

    #[test]
    fn test_program_and_read_back() {
        let card = EmulatedCard::new(CardSize::Classic1K);
        let payload = token_payload("tok_8f2a91c4d0e6b7a3");

        assert_eq!(run(&card, &payload), ProtocolOutcome::Success);
        assert_eq!(read_credential(&card).unwrap(), "tok_8f2a91c4d0e6b7a3");
        assert_eq!(card.radio().open_sessions(), 0);
        assert_eq!(card.ops().last(), Some(&CardOp::Close));
    }

    #[test]
    fn test_requires_card_key_once_keys_changed() {
        let card = EmulatedCard::new(CardSize::Classic1K);
        card.set_sector_keys(1, CARD_KEY, CARD_KEY);

        // transport key no longer opens sector 1
        assert_eq!(
            run(&card, &token_payload("abc")),
            ProtocolOutcome::Rejected(RejectReason::Authentication { sector: 1 })
        );

        let payload = CardPayload::new(vec![BlockWrite::new(
            1,
            4,
            vec![0x11; 4],
            SectorKey::new(KeyKind::A, CARD_KEY),
        )])
        .unwrap();
        assert_eq!(run(&card, &payload), ProtocolOutcome::Success);
        assert_eq!(&card.block(4)[..4], &[0x11; 4]);
    }

    #[test]
    fn test_locked_block_is_never_written() {
        let card = EmulatedCard::new(CardSize::Classic1K);
        card.lock_block(5);

        assert_eq!(
            run(&card, &token_payload("abc")),
            ProtocolOutcome::IncompatibleTag(Incompatibility::Locked { block: 5 })
        );
        assert!(!card.ops().iter().any(|op| matches!(op, CardOp::Write(_))));
    }

    #[test]
    fn test_torn_write_leaves_detectable_card() {
        let card = EmulatedCard::new(CardSize::Classic1K);
        card.inject(Fault::RemoveOnWrite { nth: 2 });
        let payload = token_payload("0123456789abcdef0123");

        assert_eq!(run(&card, &payload), ProtocolOutcome::LinkLost);
        assert!(read_credential(&card).is_err());
        assert_eq!(card.radio().open_sessions(), 0);

        // a second tap finishes the job
        card.reinsert();
        assert_eq!(run(&card, &payload), ProtocolOutcome::Success);
        assert_eq!(read_credential(&card).unwrap(), "0123456789abcdef0123");
    }

    #[test]
    fn test_removed_after_authentication() {
        let card = EmulatedCard::new(CardSize::Classic1K);
        card.inject(Fault::RemoveAfter { ops: 1 });

        assert_eq!(run(&card, &token_payload("abc")), ProtocolOutcome::LinkLost);
        assert_eq!(card.radio().open_sessions(), 0);
    }

    #[test]
    fn test_stuck_bits_are_rejected() {
        let card = EmulatedCard::new(CardSize::Classic1K);
        card.inject(Fault::StuckBits {
            block: 5,
            mask: [0x80; BLOCK_SIZE],
        });

        assert!(matches!(
            run(&card, &token_payload("abc")),
            ProtocolOutcome::Rejected(RejectReason::VerifyMismatch { block: 5 })
        ));
    }

    #[test]
    fn test_incompatible_tags_never_connect() {
        let ultralight = EmulatedCard::with_config(CardConfig {
            technology: TagTechnology::MifareUltralight,
            ..CardConfig::default()
        });
        assert_eq!(
            run(&ultralight, &token_payload("abc")),
            ProtocolOutcome::IncompatibleTag(Incompatibility::Technology)
        );
        assert!(ultralight.ops().is_empty());

        let empty = EmulatedCard::with_config(CardConfig {
            reported_geometry: Some((0, 0)),
            ..CardConfig::default()
        });
        assert!(matches!(
            run(&empty, &token_payload("abc")),
            ProtocolOutcome::IncompatibleTag(Incompatibility::Geometry { .. })
        ));
        assert!(empty.ops().is_empty());
    }

    #[test]
    fn test_image_reload_keeps_credential() {
        let card = EmulatedCard::new(CardSize::Mini);
        assert_eq!(run(&card, &token_payload("mini-card")), ProtocolOutcome::Success);

        let reloaded = EmulatedCard::from_image(&card.image()).unwrap();
        assert_eq!(reloaded.config().size, CardSize::Mini);
        assert_eq!(read_credential(&reloaded).unwrap(), "mini-card");
        assert!(EmulatedCard::from_image(&[0u8; 100]).is_none());
    }

    #[test]
    fn test_shared_radio_sees_one_session_at_a_time() {
        let radio = RadioMonitor::new();
        let payload = token_payload("abc");
        for _ in 0..3 {
            let card = EmulatedCard::new(CardSize::Classic1K).with_radio(Arc::clone(&radio));
            assert_eq!(run(&card, &payload), ProtocolOutcome::Success);
        }
        assert_eq!(radio.sessions(), 3);
        assert_eq!(radio.peak(), 1);
        assert_eq!(radio.open_sessions(), 0);
    }
}
