//! Packet index tracking for loss statistics
//!
//! AV packets carry a 16-bit packet index per stream. Gaps count as lost
//! until the missing index arrives late.

/// Tracks packet indices to detect lost packets
///
/// Uses a 64-entry bitmap behind the highest index seen so late and
/// duplicate packets are recognised across wraparound.
#[derive(Debug, Clone)]
pub struct SequenceTracker {
    /// Highest index seen, `None` before the first packet
    highest: Option<u16>,
    /// Bit N is set if (highest - N) was received
    received_bitmap: u64,
    packets_received: u64,
    packets_lost: u64,
}

/// Jumps larger than this reset tracking instead of counting loss
const WINDOW_SIZE: i32 = 64;

impl SequenceTracker {
    pub fn new() -> Self {
        Self {
            highest: None,
            received_bitmap: 0,
            packets_received: 0,
            packets_lost: 0,
        }
    }

    /// Record a received packet index.
    ///
    /// Returns the indices newly considered lost (the gap between the
    /// previous highest index and this one).
    pub fn record(&mut self, index: u16) -> Vec<u16> {
        let Some(highest) = self.highest else {
            self.highest = Some(index);
            self.received_bitmap = 1;
            self.packets_received += 1;
            return Vec::new();
        };

        let diff = index.wrapping_sub(highest) as i16 as i32;
        let mut lost = Vec::new();

        if diff > 0 {
            self.packets_received += 1;
            if diff <= WINDOW_SIZE {
                for i in 1..diff {
                    lost.push(highest.wrapping_add(i as u16));
                }
                self.packets_lost += lost.len() as u64;
                self.received_bitmap = if diff < 64 {
                    self.received_bitmap << diff
                } else {
                    0
                };
                self.received_bitmap |= 1;
            } else {
                // Large jump, start a new window
                self.received_bitmap = 1;
            }
            self.highest = Some(index);
        } else if diff < 0 && diff > -WINDOW_SIZE {
            let mask = 1u64 << (-diff);
            if self.received_bitmap & mask == 0 {
                // Late arrival of a packet counted as lost
                self.received_bitmap |= mask;
                self.packets_received += 1;
                self.packets_lost = self.packets_lost.saturating_sub(1);
            }
        }
        // diff == 0 or too old: duplicate, ignored

        lost
    }

    pub fn loss_rate(&self) -> f32 {
        let total = self.packets_received + self.packets_lost;
        if total == 0 {
            0.0
        } else {
            self.packets_lost as f32 / total as f32
        }
    }

    pub fn packets_received(&self) -> u64 {
        self.packets_received
    }

    pub fn packets_lost(&self) -> u64 {
        self.packets_lost
    }

    pub fn highest(&self) -> Option<u16> {
        self.highest
    }

    /// Check if an index within the window was received
    pub fn was_received(&self, index: u16) -> bool {
        let Some(highest) = self.highest else {
            return false;
        };
        let diff = highest.wrapping_sub(index) as i16 as i32;
        (0..64).contains(&diff) && self.received_bitmap & (1u64 << diff) != 0
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for SequenceTracker {
    fn default() -> Self {
        Self::new()
    }
}
