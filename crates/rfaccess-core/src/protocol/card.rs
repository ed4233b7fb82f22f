//! CardProtocol - the programming state machine

use std::collections::BTreeMap;

use crate::error::{Incompatibility, LinkError, RejectReason};
use crate::payload::{BlockWrite, CardPayload};
use crate::tag::{AccessBits, SectorKey, TagHandle, TagTransport, BLOCK_SIZE};

use super::{CancelSignal, ProtocolOutcome, ProtocolProgress, ProtocolState};

/// One run of the programming protocol against one tag
///
/// Blocks are always written and verified in ascending index order, so an
/// interrupted write leaves the lower (header) blocks updated first and the
/// credential detectably incomplete.
pub struct CardProtocol<'p> {
    payload: &'p CardPayload,
    state: ProtocolState,
    /// Key each payload sector accepted
    granted: BTreeMap<u8, SectorKey>,
    /// Full block images to write, parallel to `payload.writes()`
    images: Vec<[u8; BLOCK_SIZE]>,
}

impl<'p> CardProtocol<'p> {
    /// Prepare a run for a payload
    pub fn new(payload: &'p CardPayload) -> Self {
        Self {
            payload,
            state: ProtocolState::Idle,
            granted: BTreeMap::new(),
            images: Vec::with_capacity(payload.len()),
        }
    }

    /// Current phase
    pub fn state(&self) -> ProtocolState {
        self.state
    }

    /// Drive the protocol to a terminal outcome
    ///
    /// Cancellation is checked before every step and before every block
    /// write; a cancelled run ends in `LinkLost`. Calling `run` again after
    /// it finished returns the same outcome without touching the tag.
    pub fn run<T: TagTransport>(
        &mut self,
        handle: &mut TagHandle<'_, T>,
        progress: &mut dyn ProtocolProgress,
        cancel: &dyn CancelSignal,
    ) -> ProtocolOutcome {
        loop {
            if let ProtocolState::Done(outcome) = self.state {
                return outcome;
            }

            let next = if cancel.is_cancelled() {
                log::debug!("Cancelled while {}", self.state);
                ProtocolState::Done(ProtocolOutcome::LinkLost)
            } else {
                self.step(handle, progress, cancel)
                    .unwrap_or_else(|e| ProtocolState::Done(e.into()))
            };
            self.transition(next, progress);
        }
    }

    fn transition(&mut self, next: ProtocolState, progress: &mut dyn ProtocolProgress) {
        log::trace!("{} -> {}", self.state, next);
        self.state = next;
        progress.state_changed(next);
    }

    fn step<T: TagTransport>(
        &mut self,
        handle: &mut TagHandle<'_, T>,
        progress: &mut dyn ProtocolProgress,
        cancel: &dyn CancelSignal,
    ) -> Result<ProtocolState, LinkError> {
        match self.state {
            ProtocolState::Idle => Ok(ProtocolState::Authenticating),
            ProtocolState::Authenticating => {
                self.authenticate(handle)?;
                Ok(ProtocolState::VerifyingLayout)
            }
            ProtocolState::VerifyingLayout => {
                self.verify_layout(handle)?;
                Ok(ProtocolState::Writing)
            }
            ProtocolState::Writing => {
                self.write(handle, progress, cancel)?;
                Ok(ProtocolState::VerifyingWrite)
            }
            ProtocolState::VerifyingWrite => {
                self.verify_write(handle, progress)?;
                Ok(ProtocolState::Done(ProtocolOutcome::Success))
            }
            ProtocolState::Done(outcome) => Ok(ProtocolState::Done(outcome)),
        }
    }

    /// Authenticate every payload sector, lowest first
    fn authenticate<T: TagTransport>(&mut self, handle: &mut TagHandle<'_, T>) -> Result<(), LinkError> {
        for (sector, key) in self.payload.sectors() {
            let accepted = handle.authenticate_sector(sector, &key)?;
            self.granted.insert(sector, accepted);
        }
        Ok(())
    }

    fn verify_layout<T: TagTransport>(&mut self, handle: &mut TagHandle<'_, T>) -> Result<(), LinkError> {
        let geometry = handle.geometry();

        let payload = self.payload;
        for write in payload.writes() {
            let block = write.block;
            match geometry.sector_of_block(block) {
                None => return Err(incompatible(Incompatibility::BlockOutOfRange { block })),
                Some(sector) if sector != write.sector => {
                    return Err(incompatible(Incompatibility::SectorMismatch {
                        block,
                        sector: write.sector,
                    }));
                }
                Some(_) => {}
            }
            if geometry.is_reserved(block) {
                return Err(incompatible(Incompatibility::ReservedBlock { block }));
            }
        }

        self.images.clear();
        let writes = payload.writes();
        let mut start = 0;
        while start < writes.len() {
            let sector = writes[start].sector;
            let end = start + writes[start..].iter().take_while(|w| w.sector == sector).count();
            self.check_sector(handle, sector, &writes[start..end])?;
            start = end;
        }
        Ok(())
    }

    /// Check access conditions of one sector and capture its current blocks
    fn check_sector<T: TagTransport>(
        &mut self,
        handle: &mut TagHandle<'_, T>,
        sector: u8,
        writes: &[BlockWrite],
    ) -> Result<(), LinkError> {
        let geometry = handle.geometry();
        let kind = self
            .granted
            .get(&sector)
            .map(|key| key.kind)
            .ok_or(LinkError::Rejected(RejectReason::Authentication { sector }))?;

        let trailer = handle.read_block(geometry.trailer_block(sector))?;
        let bits = AccessBits::from_trailer(&trailer)
            .ok_or(incompatible(Incompatibility::AccessBits { sector }))?;
        let blocks_in_sector = geometry.blocks_in_sector(sector);

        for write in writes {
            let index = (write.block - geometry.first_block(sector)) as usize;
            let access = bits.data_block(index, blocks_in_sector);
            if !access.is_writable() {
                return Err(incompatible(Incompatibility::Locked { block: write.block }));
            }
            if !access.can_write(kind) {
                return Err(LinkError::Rejected(RejectReason::KeyNotPermitted { block: write.block }));
            }
        }

        for write in writes {
            let current = handle.read_block(write.block)?;
            if current.len() != BLOCK_SIZE {
                return Err(incompatible(Incompatibility::BlockSize {
                    block: write.block,
                    len: current.len(),
                }));
            }
            self.images.push(write.image_over(&current));
        }
        Ok(())
    }

    fn write<T: TagTransport>(
        &mut self,
        handle: &mut TagHandle<'_, T>,
        progress: &mut dyn ProtocolProgress,
        cancel: &dyn CancelSignal,
    ) -> Result<(), LinkError> {
        let total = self.images.len();
        for (i, (write, image)) in self.payload.writes().iter().zip(&self.images).enumerate() {
            if cancel.is_cancelled() {
                log::debug!("Cancelled after {} of {} blocks", i, total);
                return Err(LinkError::LinkLost);
            }
            handle.write_block(write.block, image).map_err(|e| {
                log::debug!("Write of block {} failed: {}", write.block, e);
                LinkError::LinkLost
            })?;
            progress.block_written(write.block, i + 1, total);
        }
        Ok(())
    }

    fn verify_write<T: TagTransport>(
        &mut self,
        handle: &mut TagHandle<'_, T>,
        progress: &mut dyn ProtocolProgress,
    ) -> Result<(), LinkError> {
        let total = self.images.len();
        for (i, (write, image)) in self.payload.writes().iter().zip(&self.images).enumerate() {
            let actual = handle.read_block(write.block)?;
            if actual.as_slice() != image.as_slice() {
                log::debug!("Block {} read back {:02X?}", write.block, actual);
                return Err(LinkError::Rejected(RejectReason::VerifyMismatch { block: write.block }));
            }
            progress.block_verified(write.block, i + 1, total);
        }
        Ok(())
    }
}

fn incompatible(what: Incompatibility) -> LinkError {
    LinkError::IncompatibleTag(what)
}
