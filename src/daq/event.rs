use std::ops::Range;

use bitvec::prelude::*;
use byteorder::{ByteOrder, LittleEndian};

use crate::constants::{PAYLOAD_BITS, WORDS_PER_GROUP};
use crate::error::DecodeError;

/*
    Bit layout of the 96-bit payload (bit 0 is the most significant bit).
    Bit 32 and bits 64-68 are not part of any field.
 */
const CHANNEL: Range<usize> = 3..8;
const ROLLOVER: Range<usize> = 8..24;
const COARSE_HIGH: Range<usize> = 24..32;
const COARSE_MID: Range<usize> = 33..40;
const COARSE_LOW: Range<usize> = 40..53;
const TIME_OVER_THRESHOLD: Range<usize> = 53..59;
const TRIGGER_END: Range<usize> = 59..64;
const FINE_TIME: Range<usize> = 69..74;
const ENERGY: Range<usize> = 74..88;
const CRC: Range<usize> = 88..96;

fn field(bits: &BitSlice<u16, Msb0>, range: Range<usize>) -> u32 {
    bits[range].iter().fold(0u32, |acc, bit| (acc << 1) | (*bit as u32))
}

/// # EventRecord
/// One detection decoded from an 8-word group of the DMA stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventRecord {
    pub channel: u8,
    pub rollover_time: u16,
    pub coarse_time: u32,
    pub time_over_threshold: u8,
    pub trigger_end: u8,
    pub fine_time: u8,
    pub energy: u16,
    pub crc: u8,
}

impl EventRecord {
    /// Decode a group of eight words. The first and last words are framing and are ignored.
    pub fn from_group(words: &[u16]) -> Result<Self, DecodeError> {
        if words.len() != WORDS_PER_GROUP {
            return Err(DecodeError::WrongWordCount(words.len()));
        }
        let payload = &words[1..WORDS_PER_GROUP - 1];
        let bits = payload.view_bits::<Msb0>();
        debug_assert_eq!(bits.len(), PAYLOAD_BITS);

        let coarse_time = (field(bits, COARSE_HIGH) << (COARSE_MID.len() + COARSE_LOW.len()))
            | (field(bits, COARSE_MID) << COARSE_LOW.len())
            | field(bits, COARSE_LOW);

        Ok(Self {
            channel: field(bits, CHANNEL) as u8,
            rollover_time: field(bits, ROLLOVER) as u16,
            coarse_time,
            time_over_threshold: field(bits, TIME_OVER_THRESHOLD) as u8,
            trigger_end: field(bits, TRIGGER_END) as u8,
            fine_time: field(bits, FINE_TIME) as u8,
            energy: field(bits, ENERGY) as u16,
            crc: field(bits, CRC) as u8,
        })
    }

    /// Column values in file order
    pub fn to_row(&self) -> [String; 8] {
        [
            self.channel.to_string(),
            self.rollover_time.to_string(),
            self.coarse_time.to_string(),
            self.fine_time.to_string(),
            self.time_over_threshold.to_string(),
            self.trigger_end.to_string(),
            self.energy.to_string(),
            self.crc.to_string(),
        ]
    }
}

/// # EventDecoder
/// Turns the data frames of the DMA stream into records. Each frame is a little-endian array of
/// 16-bit words, consumed eight at a time; an incomplete trailing group is dropped with the frame.
#[derive(Debug, Default)]
pub struct EventDecoder {
    groups: u64,
    dropped: u64,
}

impl EventDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn words(part: &[u8]) -> Vec<u16> {
        part.chunks_exact(2).map(LittleEndian::read_u16).collect()
    }

    /// Decode one frame, handing each record to sink as soon as its group is complete
    pub fn decode_part<E>(
        &mut self,
        part: &[u8],
        mut sink: impl FnMut(EventRecord) -> Result<(), E>,
    ) -> Result<(), E> {
        if part.len() < 2 {
            return Ok(());
        }
        let words = Self::words(part);
        let groups = words.chunks_exact(WORDS_PER_GROUP);
        let leftover = groups.remainder().len();
        for group in groups {
            match EventRecord::from_group(group) {
                Ok(record) => {
                    self.groups += 1;
                    sink(record)?;
                }
                Err(e) => {
                    self.dropped += 1;
                    log::error!("Error parsing event: {}", e);
                }
            }
        }
        if leftover != 0 {
            self.dropped += 1;
            log::warn!("Dropped a truncated group of {} words", leftover);
        }
        Ok(())
    }

    pub fn decoded(&self) -> u64 {
        self.groups
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    fn to_bytes(words: &[u16]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn framing_words_are_discarded() {
        let words = [0xABCD, 0x0500, 0, 0, 0, 0, 0, 0xEF01];
        let record = EventRecord::from_group(&words).unwrap();
        assert_eq!(record, EventRecord { channel: 5, ..Default::default() });
    }

    #[test]
    fn fields_skip_the_reserved_bits() {
        //with every payload bit set each field reads its max value
        let all = EventRecord::from_group(&[0, 0xFFFF, 0xFFFF, 0xFFFF, 0xFFFF, 0xFFFF, 0xFFFF, 0]).unwrap();
        assert_eq!(all.channel, 31);
        assert_eq!(all.rollover_time, 0xFFFF);
        assert_eq!(all.coarse_time, (1 << 28) - 1);
        assert_eq!(all.time_over_threshold, 63);
        assert_eq!(all.trigger_end, 31);
        assert_eq!(all.fine_time, 31);
        assert_eq!(all.energy, (1 << 14) - 1);
        assert_eq!(all.crc, 0xFF);

        //only the reserved bits set: bit 32 is the msb of word 3, bits 64-68 the top of word 5
        let reserved = EventRecord::from_group(&[0, 0, 0, 0x8000, 0, 0xF800, 0, 0]).unwrap();
        assert_eq!(reserved, EventRecord::default());
    }

    #[test]
    fn coarse_time_concatenates_its_pieces() {
        //bits 24-31 = 0x01, bit 32 set (ignored), bits 33-39 = 0, bits 40-52 = 1
        let words = [0, 0, 0x0001, 0x8000, 0x0800, 0, 0, 0];
        let record = EventRecord::from_group(&words).unwrap();
        assert_eq!(record.coarse_time, (1 << 20) | 1);
        assert_eq!(record.rollover_time, 0);
    }

    #[test]
    fn truncated_group_drops_only_itself() {
        let mut decoder = EventDecoder::new();
        let mut records = Vec::new();

        let mut first = to_bytes(&[0xABCD, 0x0500, 0, 0, 0, 0, 0, 0xEF01]);
        first.extend(to_bytes(&[0xABCD, 0x0700, 0, 0]));
        let second = to_bytes(&[0xABCD, 0x0300, 0, 0, 0, 0, 0, 0xEF01]);

        for part in [first, vec![0x01], second] {
            decoder
                .decode_part(&part, |record| {
                    records.push(record);
                    Ok::<(), Infallible>(())
                })
                .unwrap();
        }

        assert_eq!(records.iter().map(|r| r.channel).collect::<Vec<_>>(), vec![5, 3]);
        assert_eq!(decoder.decoded(), 2);
        assert_eq!(decoder.dropped(), 1);
    }

    #[test]
    fn row_order_puts_fine_time_before_tot() {
        let record = EventRecord { channel: 1, rollover_time: 2, coarse_time: 3, time_over_threshold: 4, trigger_end: 5, fine_time: 6, energy: 7, crc: 8 };
        assert_eq!(record.to_row(), ["1", "2", "3", "6", "4", "5", "7", "8"].map(String::from));
    }
}
