use ulid::Ulid;

use crate::model::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bucket {
    Available,
    Reserved,
    OutOfService,
}

fn bucket(status: SlotStatus) -> Bucket {
    match status {
        SlotStatus::Available => Bucket::Available,
        SlotStatus::Reserved | SlotStatus::Occupied => Bucket::Reserved,
        SlotStatus::Maintenance | SlotStatus::OutOfService => Bucket::OutOfService,
    }
}

impl Capacity {
    fn counter(&mut self, b: Bucket) -> &mut u32 {
        match b {
            Bucket::Available => &mut self.available,
            Bucket::Reserved => &mut self.reserved,
            Bucket::OutOfService => &mut self.out_of_service,
        }
    }

    fn add(&mut self, b: Bucket) {
        *self.counter(b) += 1;
        if b != Bucket::OutOfService {
            self.total += 1;
        }
    }

    fn sub(&mut self, b: Bucket) {
        let c = self.counter(b);
        debug_assert!(*c > 0, "ledger underflow in {b:?}");
        *c = c.saturating_sub(1);
        if b != Bucket::OutOfService {
            self.total = self.total.saturating_sub(1);
        }
    }

    pub fn on_slot_added(&mut self, status: SlotStatus) {
        self.add(bucket(status));
    }

    pub fn on_slot_removed(&mut self, status: SlotStatus) {
        self.sub(bucket(status));
    }

    pub fn on_slot_status_change(&mut self, old: SlotStatus, new: SlotStatus) {
        let (from, to) = (bucket(old), bucket(new));
        if from != to {
            self.sub(from);
            self.add(to);
        }
    }

    pub fn is_conserved(&self) -> bool {
        self.available + self.reserved == self.total
    }

    /// Rebuild counters from scratch.
    pub fn from_statuses(statuses: impl IntoIterator<Item = SlotStatus>) -> Self {
        let mut c = Capacity::default();
        for s in statuses {
            c.on_slot_added(s);
        }
        c
    }
}

/// Recompute a slot's status and move it between ledger buckets.
/// The only writer of `SlotState::status`.
pub(crate) fn sync_slot_status(ps: &mut PlaceState, slot_id: &Ulid) {
    let Some(slot) = ps.slot_mut(slot_id) else { return };
    let old = slot.status;
    let new = slot.derive_status();
    if old == new {
        return;
    }
    slot.status = new;
    ps.capacity.on_slot_status_change(old, new);
}

/// Counters as they would be if rebuilt from slot statuses. Differs from
/// `ps.capacity` only if some path bypassed `sync_slot_status`.
pub fn recount(ps: &PlaceState) -> Capacity {
    Capacity::from_statuses(ps.slots.iter().map(|s| s.status))
}
