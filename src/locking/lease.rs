//! The lease state machine. Lease state is a bitmask of three flags:
//! R (cached reads), W (cached writes), H (cached open handle).

use modular_bitfield::prelude::*;

use super::AccessIntent;

pub type LeaseKey = [u8; 16];

#[bitfield]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LeaseState {
    pub read_caching: bool,
    pub handle_caching: bool,
    pub write_caching: bool,
    #[skip]
    __: B29,
}

impl LeaseState {
    pub fn none() -> Self {
        LeaseState::new()
    }

    pub fn is_none(&self) -> bool {
        !self.read_caching() && !self.handle_caching() && !self.write_caching()
    }

    pub fn has_content(&self) -> bool {
        self.read_caching() || self.write_caching()
    }

    /// True when `self` grants no flag that `other` lacks.
    pub fn is_subset_of(&self, other: &LeaseState) -> bool {
        (!self.read_caching() || other.read_caching())
            && (!self.handle_caching() || other.handle_caching())
            && (!self.write_caching() || other.write_caching())
    }

    pub fn intersect(&self, other: &LeaseState) -> LeaseState {
        LeaseState::new()
            .with_read_caching(self.read_caching() && other.read_caching())
            .with_handle_caching(self.handle_caching() && other.handle_caching())
            .with_write_caching(self.write_caching() && other.write_caching())
    }

    pub fn union(&self, other: &LeaseState) -> LeaseState {
        LeaseState::new()
            .with_read_caching(self.read_caching() || other.read_caching())
            .with_handle_caching(self.handle_caching() || other.handle_caching())
            .with_write_caching(self.write_caching() || other.write_caching())
    }
}

/// Two leases held by different clients conflict iff the AND of their
/// content states is non-empty: W collides with W, and with R on the
/// other side. H is orthogonal for read/write purposes.
pub fn leases_conflict(a: &LeaseState, b: &LeaseState) -> bool {
    (a.write_caching() && (b.write_caching() || b.read_caching()))
        || (b.write_caching() && a.read_caching())
}

/// The state a lease must drop to before an operation with `intent` may
/// proceed — always a subset of the current state.
pub fn break_to_for(state: LeaseState, intent: AccessIntent) -> LeaseState {
    match intent {
        // A foreign read only invalidates cached writes.
        AccessIntent::Read => state.with_write_caching(false),
        // A foreign write invalidates cached reads and writes.
        AccessIntent::Write => state.with_write_caching(false).with_read_caching(false),
        // Unlink must also collapse cached open handles.
        AccessIntent::Unlink => LeaseState::none(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: LeaseKey,
    pub state: LeaseState,
    pub epoch: u16,
    /// A break is outstanding; operations that need the post-break state
    /// wait until this clears.
    pub breaking: bool,
    pub break_to: LeaseState,
}

impl Lease {
    pub fn new(key: LeaseKey, state: LeaseState) -> Self {
        Lease {
            key,
            state,
            epoch: 1,
            breaking: false,
            break_to: LeaseState::none(),
        }
    }

    /// Would an operation with `intent` require this lease to shrink?
    pub fn obstructs(&self, intent: AccessIntent) -> bool {
        match intent {
            AccessIntent::Read => self.state.write_caching(),
            AccessIntent::Write => self.state.write_caching() || self.state.read_caching(),
            AccessIntent::Unlink => !self.state.is_none(),
        }
    }
}
