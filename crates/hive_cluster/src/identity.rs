//! Local identity: the process-lifetime UUID and the ephemeral node id.
//!
//! Node ids are 15-bit positive values drawn at random without any
//! coordination. When another member heartbeats our id with a different
//! UUID we give the id up and draw a new one on the next send cycle, so the
//! most recent claimant keeps it.

use std::fmt;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use uuid::Uuid;

use crate::error::{ClusterError, Result};

/// Id value meaning "not yet allocated" or "given up after a collision".
pub const UNASSIGNED_ID: i16 = 0;

/// Draws before allocation is declared impossible.
pub const MAX_ALLOCATION_ATTEMPTS: u32 = 100;

/// Draw a random positive id (top bit clear, never zero).
pub fn allocate_id(rng: &mut dyn RngCore) -> Result<i16> {
    for _ in 0..MAX_ALLOCATION_ATTEMPTS {
        let candidate = (rng.next_u32() as u16 & 0x7FFF) as i16;
        if candidate > 0 {
            return Ok(candidate);
        }
    }
    Err(ClusterError::IdentityExhausted(MAX_ALLOCATION_ATTEMPTS))
}

/// An id handed out by [`LocalIdentity::ensure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdLease {
    pub id: i16,
    /// True when the id was allocated by this call and must be announced.
    pub fresh: bool,
}

struct IdState {
    id: i16,
    rng: Box<dyn RngCore + Send>,
}

/// This process's identity on the cluster.
pub struct LocalIdentity {
    uuid: Uuid,
    state: Mutex<IdState>,
}

impl LocalIdentity {
    /// Create an identity with a fresh UUID and an OS-seeded CSPRNG.
    pub fn generate() -> Self {
        Self::with_rng(Uuid::new_v4(), Box::new(StdRng::from_os_rng()))
    }

    /// Create an identity with a caller-supplied random source.
    pub fn with_rng(uuid: Uuid, rng: Box<dyn RngCore + Send>) -> Self {
        Self {
            uuid,
            state: Mutex::new(IdState {
                id: UNASSIGNED_ID,
                rng,
            }),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// The current id, or [`UNASSIGNED_ID`].
    pub fn current_id(&self) -> i16 {
        self.state.lock().id
    }

    /// Return the current id, allocating one if none is held.
    pub fn ensure(&self) -> Result<IdLease> {
        let mut state = self.state.lock();
        if state.id != UNASSIGNED_ID {
            return Ok(IdLease {
                id: state.id,
                fresh: false,
            });
        }
        let id = allocate_id(state.rng.as_mut())?;
        state.id = id;
        tracing::info!("Allocated node id {id} for {}", self.uuid);
        Ok(IdLease { id, fresh: true })
    }

    /// Give up `id` if it is still ours. Returns whether it was invalidated.
    pub fn invalidate(&self, id: i16) -> bool {
        let mut state = self.state.lock();
        if id != UNASSIGNED_ID && state.id == id {
            state.id = UNASSIGNED_ID;
            true
        } else {
            false
        }
    }
}

impl fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalIdentity")
            .field("uuid", &self.uuid)
            .field("id", &self.current_id())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
