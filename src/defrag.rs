/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::collections::HashMap;

use arrayvec::ArrayVec;

use crate::proto::{FRAGMENT_ASSEMBLY_TIMEOUT, MAX_FRAGMENTS, MAX_INBOUND_FRAGMENTED_PACKETS_PER_PATH};

/// One received datagram queued for reassembly. The head carries the whole
/// packet header at offset zero; trailing fragments start their payload after
/// the fragment header.
pub(crate) struct Fragment {
    pub buf: Vec<u8>,
    pub payload_start: usize,
}

impl Fragment {
    #[inline(always)]
    pub fn payload(&self) -> &[u8] {
        &self.buf[self.payload_start..]
    }
}

/// Outcome of feeding one fragment to the defragmenter.
pub(crate) enum Assembled {
    /// Fragment accepted, packet not yet complete.
    Ok,
    /// All fragments received; slices returned in ascending fragment order.
    Complete(ArrayVec<Fragment, MAX_FRAGMENTS>),
    ErrDuplicateFragment,
    ErrInvalidFragment,
    ErrTooManyFragmentsForPath,
}

struct FragmentSet {
    ts_ticks: i64,
    total: u8,
    have_mask: u8,
    completed: bool,
    frags: [Option<Fragment>; MAX_FRAGMENTS],
}

impl FragmentSet {
    fn new(now: i64) -> Self {
        Self {
            ts_ticks: now,
            total: 0,
            have_mask: 0,
            completed: false,
            frags: Default::default(),
        }
    }
}

/// Stateful packet reassembler, one per path.
///
/// Completed sets linger as empty tombstones until the assembly timeout so
/// that late duplicate fragments of an already dispatched packet are reported
/// as duplicates rather than seeding a new partial packet.
pub(crate) struct Defragmenter {
    sets: HashMap<u64, FragmentSet>,
}

impl Defragmenter {
    pub fn new() -> Self {
        Self { sets: HashMap::with_capacity(4) }
    }

    pub fn assemble(&mut self, packet_id: u64, fragment: Fragment, fragment_no: u8, total_fragments: u8, now: i64) -> Assembled {
        if fragment_no as usize >= MAX_FRAGMENTS || total_fragments as usize > MAX_FRAGMENTS {
            return Assembled::ErrInvalidFragment;
        }

        if !self.sets.contains_key(&packet_id) {
            if self.sets.len() >= MAX_INBOUND_FRAGMENTED_PACKETS_PER_PATH {
                self.service(now);
            }
            if self.sets.len() >= MAX_INBOUND_FRAGMENTED_PACKETS_PER_PATH {
                // Sacrifice the oldest partial packet and report the flood.
                if let Some(oldest) = self.sets.iter().min_by_key(|(_, s)| s.ts_ticks).map(|(id, _)| *id) {
                    self.sets.remove(&oldest);
                }
                return Assembled::ErrTooManyFragmentsForPath;
            }
            self.sets.insert(packet_id, FragmentSet::new(now));
        }

        let set = self.sets.get_mut(&packet_id).unwrap();

        if set.completed {
            return Assembled::ErrDuplicateFragment;
        }
        if total_fragments != 0 {
            if set.total != 0 && set.total != total_fragments {
                return Assembled::ErrInvalidFragment;
            }
            set.total = total_fragments;
        }
        let got = 1u8 << fragment_no;
        if (set.have_mask & got) != 0 {
            return Assembled::ErrDuplicateFragment;
        }
        set.have_mask |= got;
        set.frags[fragment_no as usize] = Some(fragment);

        if set.total != 0 && set.have_mask == ((1u16 << set.total) - 1) as u8 {
            set.completed = true;
            let mut assembled = ArrayVec::new();
            for f in set.frags.iter_mut().take(set.total as usize) {
                assembled.push(f.take().unwrap());
            }
            Assembled::Complete(assembled)
        } else {
            Assembled::Ok
        }
    }

    /// Drop fragment sets older than the assembly timeout.
    pub fn service(&mut self, now: i64) {
        self.sets.retain(|_, set| (now - set.ts_ticks) < FRAGMENT_ASSEMBLY_TIMEOUT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frag(tag: u8) -> Fragment {
        Fragment { buf: vec![tag; 32], payload_start: 16 }
    }

    fn feed(d: &mut Defragmenter, id: u64, no: u8, total: u8, now: i64) -> Assembled {
        d.assemble(id, frag(no), no, total, now)
    }

    #[test]
    fn any_order_yields_one_complete() {
        let orders: [[u8; 3]; 6] = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];
        for order in orders {
            let mut d = Defragmenter::new();
            let mut completes = 0;
            for (i, no) in order.iter().enumerate() {
                // The head does not know the fragment count; trailing fragments do.
                let total = if *no == 0 { 0 } else { 3 };
                match feed(&mut d, 7, *no, total, 1) {
                    Assembled::Complete(a) => {
                        completes += 1;
                        assert_eq!(i, 2, "completed early in order {:?}", order);
                        assert_eq!(a.len(), 3);
                        for (no, f) in a.iter().enumerate() {
                            assert_eq!(f.buf[0], no as u8);
                        }
                    }
                    Assembled::Ok => assert!(i < 2),
                    _ => panic!("unexpected error in order {:?}", order),
                }
            }
            assert_eq!(completes, 1);
        }
    }

    #[test]
    fn duplicates_reported_before_and_after_completion() {
        let mut d = Defragmenter::new();
        assert!(matches!(feed(&mut d, 1, 0, 0, 1), Assembled::Ok));
        assert!(matches!(feed(&mut d, 1, 1, 3, 1), Assembled::Ok));
        assert!(matches!(feed(&mut d, 1, 1, 3, 1), Assembled::ErrDuplicateFragment));
        assert!(matches!(feed(&mut d, 1, 2, 3, 1), Assembled::Complete(_)));
        assert!(matches!(feed(&mut d, 1, 1, 3, 1), Assembled::ErrDuplicateFragment));
        assert!(matches!(feed(&mut d, 1, 1, 3, 1), Assembled::ErrDuplicateFragment));
    }

    #[test]
    fn conflicting_total_rejected() {
        let mut d = Defragmenter::new();
        assert!(matches!(feed(&mut d, 1, 1, 3, 1), Assembled::Ok));
        assert!(matches!(feed(&mut d, 1, 2, 4, 1), Assembled::ErrInvalidFragment));
    }

    #[test]
    fn out_of_range_rejected() {
        let mut d = Defragmenter::new();
        assert!(matches!(feed(&mut d, 1, MAX_FRAGMENTS as u8, 0, 1), Assembled::ErrInvalidFragment));
        assert!(matches!(feed(&mut d, 1, 0, (MAX_FRAGMENTS + 1) as u8, 1), Assembled::ErrInvalidFragment));
    }

    #[test]
    fn per_path_flood_bound() {
        let mut d = Defragmenter::new();
        for id in 0..MAX_INBOUND_FRAGMENTED_PACKETS_PER_PATH as u64 {
            assert!(matches!(feed(&mut d, id, 0, 0, id as i64), Assembled::Ok));
        }
        // Table is full and nothing has timed out; oldest set (id 0) is evicted.
        assert!(matches!(feed(&mut d, 1000, 0, 0, 100), Assembled::ErrTooManyFragmentsForPath));
        assert_eq!(d.sets.len(), MAX_INBOUND_FRAGMENTED_PACKETS_PER_PATH - 1);
        assert!(!d.sets.contains_key(&0));
        assert!(matches!(feed(&mut d, 1000, 0, 0, 100), Assembled::Ok));
    }

    #[test]
    fn stale_sets_expire() {
        let mut d = Defragmenter::new();
        assert!(matches!(feed(&mut d, 1, 0, 0, 0), Assembled::Ok));
        d.service(FRAGMENT_ASSEMBLY_TIMEOUT + 1);
        assert!(d.sets.is_empty());
        // A late fragment then just starts over.
        assert!(matches!(feed(&mut d, 1, 1, 3, FRAGMENT_ASSEMBLY_TIMEOUT + 2), Assembled::Ok));
    }
}
