//! TagLink - exclusive owner of the proximity-field session
//!
//! Opening a tag borrows the link mutably for the lifetime of the returned
//! [`TagHandle`], so at most one handle can exist per link at any time. The
//! handle folds every transport error into [`LinkError::LinkLost`] and, once
//! lost, refuses further operations without touching the radio.

use std::collections::BTreeMap;

use crate::error::{Incompatibility, LinkError, RejectReason, TransportError};

use super::geometry::CardGeometry;
use super::key::{SectorKey, KEY_LEN, TRANSPORT_KEY};
use super::traits::{format_uid, TagTechnology, TagTransport, BLOCK_SIZE};

/// Upper bound for [`KeyPolicy::max_attempts`]
pub const MAX_KEY_ATTEMPTS: u8 = 4;

/// Which keys are presented when authenticating a sector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPolicy {
    /// Maximum number of keys presented per sector (1..=4)
    pub max_attempts: u8,
    /// Fallback key tried after the credential key (`None` disables it)
    pub default_key: Option<[u8; KEY_LEN]>,
}

impl Default for KeyPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            default_key: Some(TRANSPORT_KEY),
        }
    }
}

impl KeyPolicy {
    /// Keys to present for a sector whose credential key is `key`, in order
    pub fn candidates(&self, key: &SectorKey) -> Vec<SectorKey> {
        let mut keys = vec![*key];
        if let Some(default) = self.default_key {
            let fallback = SectorKey::new(key.kind, default);
            if fallback != *key {
                keys.push(fallback);
            }
        }
        keys.truncate(self.max_attempts.clamp(1, MAX_KEY_ATTEMPTS) as usize);
        keys
    }
}

/// Owner of the radio session
///
/// There is one `TagLink` per physical reader.
#[derive(Debug, Default)]
pub struct TagLink {
    policy: KeyPolicy,
    opened: u64,
}

impl TagLink {
    /// Create a link using the given key policy
    pub fn new(policy: KeyPolicy) -> Self {
        Self { policy, opened: 0 }
    }

    /// Key policy used by handles of this link
    pub fn policy(&self) -> &KeyPolicy {
        &self.policy
    }

    /// Number of handles opened over the lifetime of this link
    pub fn sessions_opened(&self) -> u64 {
        self.opened
    }

    /// Open a session on a freshly presented tag
    ///
    /// Fails with `IncompatibleTag` (without connecting) if the tag is not a
    /// MIFARE Classic card of a known geometry, and with `LinkLost` if it
    /// left the field before the session could be claimed.
    pub fn open<T: TagTransport>(&mut self, mut tag: T) -> Result<TagHandle<'_, T>, LinkError> {
        let technology = tag.technology();
        if technology != TagTechnology::MifareClassic {
            log::info!("Ignoring {:?} tag {}", technology, format_uid(tag.uid()));
            return Err(LinkError::IncompatibleTag(Incompatibility::Technology));
        }

        let sectors = tag.sector_count();
        let blocks = tag.block_count();
        let geometry = CardGeometry::from_counts(sectors, blocks).ok_or(
            LinkError::IncompatibleTag(Incompatibility::Geometry { sectors, blocks }),
        )?;

        if let Err(e) = tag.connect() {
            log::debug!("Connect failed: {}", e);
            tag.close();
            return Err(LinkError::LinkLost);
        }

        self.opened += 1;
        let uid = tag.uid().to_vec();
        log::debug!(
            "Opened {} tag {} ({} sectors)",
            geometry.size().name(),
            format_uid(&uid),
            geometry.sector_count()
        );

        Ok(TagHandle {
            link: self,
            tag,
            geometry,
            uid,
            state: HandleState::Open,
            grants: BTreeMap::new(),
            active_sector: None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandleState {
    Open,
    Lost,
    Closed,
}

/// One open session with a physical tag
///
/// Dropping the handle closes it.
pub struct TagHandle<'l, T: TagTransport> {
    link: &'l mut TagLink,
    tag: T,
    geometry: CardGeometry,
    uid: Vec<u8>,
    state: HandleState,
    /// Key accepted for each authenticated sector
    grants: BTreeMap<u8, SectorKey>,
    /// Sector the tag currently holds authentication for
    active_sector: Option<u8>,
}

impl<T: TagTransport> TagHandle<'_, T> {
    /// Memory geometry of the tag
    pub fn geometry(&self) -> CardGeometry {
        self.geometry
    }

    /// UID of the tag
    pub fn uid(&self) -> &[u8] {
        &self.uid
    }

    /// Whether the handle can still be used
    pub fn is_open(&self) -> bool {
        self.state == HandleState::Open
    }

    /// Key accepted for a sector, if it has been authenticated
    pub fn granted_key(&self, sector: u8) -> Option<&SectorKey> {
        self.grants.get(&sector)
    }

    /// Authenticate a sector
    ///
    /// Presents the keys from the link's [`KeyPolicy`] in order and returns
    /// the one that was accepted. Running out of keys is `Rejected`; a
    /// transport failure is `LinkLost`.
    pub fn authenticate_sector(&mut self, sector: u8, key: &SectorKey) -> Result<SectorKey, LinkError> {
        self.ensure_open()?;

        if sector as usize >= self.geometry.sector_count() {
            return Err(LinkError::IncompatibleTag(Incompatibility::SectorOutOfRange { sector }));
        }

        for (attempt, candidate) in self.link.policy.candidates(key).into_iter().enumerate() {
            match self.tag.authenticate(sector, &candidate) {
                Ok(true) => {
                    log::debug!(
                        "Sector {} authenticated with key {} (attempt {})",
                        sector,
                        candidate.kind,
                        attempt + 1
                    );
                    self.grants.insert(sector, candidate);
                    self.active_sector = Some(sector);
                    return Ok(candidate);
                }
                Ok(false) => {
                    log::debug!("Sector {} refused key attempt {}", sector, attempt + 1);
                    self.active_sector = None;
                }
                Err(e) => return Err(self.lose(e)),
            }
        }

        Err(LinkError::Rejected(RejectReason::Authentication { sector }))
    }

    /// Read one block
    pub fn read_block(&mut self, block: u16) -> Result<Vec<u8>, LinkError> {
        self.ensure_open()?;
        self.select_sector(block)?;
        match self.tag.read_block(block) {
            Ok(data) => Ok(data),
            Err(e) => Err(self.lose(e)),
        }
    }

    /// Write one full block
    pub fn write_block(&mut self, block: u16, data: &[u8; BLOCK_SIZE]) -> Result<(), LinkError> {
        self.ensure_open()?;
        self.select_sector(block)?;
        match self.tag.write_block(block, data) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.lose(e)),
        }
    }

    /// Release the session; safe to call any number of times
    pub fn close(&mut self) {
        if self.state == HandleState::Closed {
            return;
        }
        self.tag.close();
        self.state = HandleState::Closed;
        self.active_sector = None;
        log::debug!("Closed tag {}", format_uid(&self.uid));
    }

    fn ensure_open(&self) -> Result<(), LinkError> {
        match self.state {
            HandleState::Open => Ok(()),
            HandleState::Lost | HandleState::Closed => Err(LinkError::LinkLost),
        }
    }

    /// Make sure the tag holds authentication for the sector of `block`
    ///
    /// The tag only remembers the last authenticated sector, so moving to
    /// another sector re-presents the key that sector accepted earlier.
    fn select_sector(&mut self, block: u16) -> Result<(), LinkError> {
        let sector = self
            .geometry
            .sector_of_block(block)
            .ok_or(LinkError::IncompatibleTag(Incompatibility::BlockOutOfRange { block }))?;

        if self.active_sector == Some(sector) {
            return Ok(());
        }
        let Some(key) = self.grants.get(&sector).copied() else {
            return Ok(());
        };

        match self.tag.authenticate(sector, &key) {
            Ok(true) => {
                self.active_sector = Some(sector);
                Ok(())
            }
            Ok(false) => {
                log::debug!("Sector {} no longer accepts its key", sector);
                self.state = HandleState::Lost;
                Err(LinkError::LinkLost)
            }
            Err(e) => Err(self.lose(e)),
        }
    }

    fn lose(&mut self, e: TransportError) -> LinkError {
        log::debug!("Link to {} lost: {}", format_uid(&self.uid), e);
        self.state = HandleState::Lost;
        self.active_sector = None;
        LinkError::LinkLost
    }
}

impl<T: TagTransport> Drop for TagHandle<'_, T> {
    fn drop(&mut self) {
        self.close();
    }
}
