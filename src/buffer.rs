//! Circular buffer of packet slots, addressed by sequence number.
//!
//! `first` and `last` are free-running counters masked into the slot array,
//! so a power-of-two capacity turns every modulo into a bit-and:
//!
//! ```text
//! first ... (last - 1)  last
//!   ^            ^       ^
//! [s0] ...     [smax] [snext]
//! ```

use crate::packet::Packet;

/// Fixed-capacity ring of [`Packet`] slots.
pub struct PacketBuffer {
    slots: Box<[Packet]>,
    /// First used slot.
    first: u32,
    /// Next free slot.
    last: u32,
}

impl PacketBuffer {
    /// Creates an empty buffer of `capacity` slots.
    ///
    /// # Panics
    ///
    /// Panics unless `capacity` is a power of two no larger than 2³¹.
    pub fn new(capacity: u32) -> Self {
        assert!(capacity.is_power_of_two(), "{capacity} is not a power of 2");
        assert!(capacity <= u32::MAX >> 1, "{capacity} is too big");
        Self {
            slots: vec![Packet::default(); capacity as usize].into_boxed_slice(),
            first: 0,
            last: 0,
        }
    }

    fn index(&self, idx: u32) -> usize {
        (idx & (self.capacity() - 1)) as usize
    }

    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    /// How many slots are filled.
    pub fn used(&self) -> u32 {
        self.last.wrapping_sub(self.first)
    }

    /// How many slots are free.
    pub fn free_slots(&self) -> u32 {
        self.capacity() - self.used()
    }

    pub fn is_empty(&self) -> bool {
        self.first == self.last
    }

    pub fn is_full(&self) -> bool {
        self.used() >= self.capacity()
    }

    /// Oldest used slot, `None` when empty.
    pub fn first(&self) -> Option<&Packet> {
        if self.is_empty() {
            return None;
        }
        Some(&self.slots[self.index(self.first)])
    }

    /// Newest used slot, `None` when empty.
    pub fn last(&self) -> Option<&Packet> {
        if self.is_empty() {
            return None;
        }
        Some(&self.slots[self.index(self.last.wrapping_sub(1))])
    }

    /// Appends a slot and returns it. The slot holds whatever it last
    /// held; the caller is expected to fill it.
    ///
    /// # Panics
    ///
    /// Panics when the buffer is full.
    pub fn enqueue(&mut self) -> &mut Packet {
        assert!(
            !self.is_full(),
            "cannot enqueue in a full buffer [used: {}, capacity: {}]",
            self.used(),
            self.capacity()
        );
        let idx = self.index(self.last);
        self.last = self.last.wrapping_add(1);
        &mut self.slots[idx]
    }

    /// Removes the oldest slot and returns its contents.
    ///
    /// # Panics
    ///
    /// Panics when the buffer is empty.
    pub fn dequeue(&mut self) -> Packet {
        assert!(!self.is_empty(), "cannot dequeue from an empty buffer");
        let idx = self.index(self.first);
        self.first = self.first.wrapping_add(1);
        std::mem::take(&mut self.slots[idx])
    }

    /// Slot at an absolute (unmasked) index.
    ///
    /// # Panics
    ///
    /// Panics when `idx` does not denote a used slot.
    pub fn at(&self, idx: u32) -> &Packet {
        assert!(
            idx.wrapping_sub(self.first) < self.used(),
            "index {idx} is out of bounds [first: {}, used: {}]",
            self.first,
            self.used()
        );
        &self.slots[self.index(idx)]
    }

    /// Returns the slot for the requested sequence number, allocating
    /// slots as needed so that a hole for a future in-sequence packet is
    /// explicitly reserved. Reserved slots are pre-stamped with their
    /// running sequence number.
    ///
    /// # Panics
    ///
    /// Panics if `seq` is further than `capacity` slots ahead of the head.
    pub fn slot_for_seq(&mut self, seq: u8) -> &mut Packet {
        if self.is_empty() {
            self.enqueue().set_seq(seq);
            log::debug!("slot #{seq} is the only one in the buffer");
        }
        let first_seq = match self.first() {
            Some(pkt) => pkt.seq(),
            None => unreachable!(),
        };
        let offset = seq.wrapping_sub(first_seq) as u32;
        assert!(
            offset <= self.capacity(),
            "cannot reach #{seq} from the head [start: #{first_seq}, capacity: {}]",
            self.capacity()
        );
        while offset >= self.used() {
            let stamp = first_seq.wrapping_add(self.used() as u8);
            self.enqueue().set_seq(stamp);
            log::debug!("reserved slot for #{stamp}");
        }
        let idx = self.index(self.first.wrapping_add(offset));
        let slot = &mut self.slots[idx];
        debug_assert_eq!(slot.seq(), seq, "buffer was not extended properly");
        slot
    }

    /// Iterates the used slots in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Packet> {
        (0..self.used()).map(move |off| &self.slots[self.index(self.first.wrapping_add(off))])
    }
}
