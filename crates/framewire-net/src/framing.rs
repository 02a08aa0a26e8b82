//! Length-prefixed message framing, carrying the 13 header variants from
//! `trunk/inetcode.c`'s `itmc_head_len`/`itmc_head_inc` tables verbatim (§11,
//! §4.7).
//!
//! Every mode prefixes a payload with a fixed-width length field, in either
//! byte order, at one of three widths (1/2/4 bytes). The "E" modes encode
//! the *total* frame length (header included); the plain modes encode just
//! the payload length. Mode 12 packs a 24-bit payload length and an 8-bit
//! caller-supplied mask into one big-endian-agnostic dword — used to fold a
//! message-type tag into the length field instead of spending a separate
//! byte on it.

use framewire_utils::{safe_assert, ArrayVec};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum HeaderMode {
    WordLsb = 0,
    WordMsb = 1,
    DwordLsb = 2,
    DwordMsb = 3,
    ByteLsb = 4,
    ByteMsb = 5,
    EWordLsb = 6,
    EWordMsb = 7,
    EDwordLsb = 8,
    EDwordMsb = 9,
    EByteLsb = 10,
    EByteMsb = 11,
    DwordMask = 12,
}

const HEAD_LEN: [usize; 13] = [2, 2, 4, 4, 1, 1, 2, 2, 4, 4, 1, 1, 4];
const HEAD_INC: [usize; 13] = [0, 0, 0, 0, 0, 0, 2, 2, 4, 4, 1, 1, 0];

impl HeaderMode {
    #[inline]
    fn index(self) -> usize {
        self as u8 as usize
    }

    #[inline]
    pub fn header_len(self) -> usize {
        HEAD_LEN[self.index()]
    }

    /// Bytes added to the decoded length field to get the total frame size
    /// (header + payload). Zero for modes where the length field already
    /// means "payload only".
    #[inline]
    fn header_inc(self) -> usize {
        HEAD_INC[self.index()]
    }

    #[inline]
    fn is_msb(self) -> bool {
        matches!(self, Self::WordMsb | Self::DwordMsb | Self::ByteMsb | Self::EWordMsb | Self::EDwordMsb | Self::EByteMsb)
    }
}

/// Encodes `payload_len`'s header into a fixed-capacity buffer. `mask` is
/// only meaningful for [`HeaderMode::DwordMask`] and is folded into the top
/// byte of the length field; it's ignored for every other mode.
///
/// Panics (`safe_assert!`-style precondition) if `payload_len` doesn't fit
/// the mode's field width — callers are expected to have already checked
/// `payload_len <= max_payload_len(mode)`.
pub fn encode_header(payload_len: u32, mode: HeaderMode, mask: u8) -> ArrayVec<u8, 4> {
    safe_assert!(
        payload_len as u64 <= max_payload_len(mode),
        "payload_len {} exceeds max_payload_len({:?}) = {}",
        payload_len,
        mode,
        max_payload_len(mode)
    );
    let len = payload_len as u64 + mode.header_inc() as u64;
    let mut out: ArrayVec<u8, 4> = ArrayVec::new();

    match mode {
        HeaderMode::ByteLsb | HeaderMode::ByteMsb | HeaderMode::EByteLsb | HeaderMode::EByteMsb => {
            out.push(len as u8);
        }
        HeaderMode::WordLsb | HeaderMode::EWordLsb => {
            out.extend((len as u16).to_le_bytes());
        }
        HeaderMode::WordMsb | HeaderMode::EWordMsb => {
            out.extend((len as u16).to_be_bytes());
        }
        HeaderMode::DwordLsb | HeaderMode::EDwordLsb => {
            out.extend((len as u32).to_le_bytes());
        }
        HeaderMode::DwordMsb | HeaderMode::EDwordMsb => {
            out.extend((len as u32).to_be_bytes());
        }
        HeaderMode::DwordMask => {
            let word = ((mask as u32) << 24) | (payload_len & 0x00ff_ffff);
            out.extend(word.to_le_bytes());
        }
    }
    out
}

/// Decodes the header at the front of `buf`. Returns `None` if `buf` doesn't
/// yet hold a full header (the caller should keep buffering).
///
/// On success returns `(total_frame_len, mask)` where `total_frame_len`
/// includes the header itself, and `mask` is the mode-12 tag byte (`0` for
/// every other mode).
pub fn decode_available(buf: &[u8], mode: HeaderMode) -> Option<(usize, u8)> {
    let hlen = mode.header_len();
    if buf.len() < hlen {
        return None;
    }

    let (raw, mask) = match mode {
        HeaderMode::ByteLsb | HeaderMode::ByteMsb | HeaderMode::EByteLsb | HeaderMode::EByteMsb => {
            (buf[0] as u64, 0u8)
        }
        HeaderMode::WordLsb | HeaderMode::EWordLsb => {
            (u16::from_le_bytes([buf[0], buf[1]]) as u64, 0u8)
        }
        HeaderMode::WordMsb | HeaderMode::EWordMsb => {
            (u16::from_be_bytes([buf[0], buf[1]]) as u64, 0u8)
        }
        HeaderMode::DwordLsb | HeaderMode::EDwordLsb => {
            (u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as u64, 0u8)
        }
        HeaderMode::DwordMsb | HeaderMode::EDwordMsb => {
            (u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as u64, 0u8)
        }
        HeaderMode::DwordMask => {
            let word = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
            ((word & 0x00ff_ffff) as u64, (word >> 24) as u8)
        }
    };

    let payload_len = raw as usize - (mode.header_inc().min(raw as usize));
    let total = hlen + payload_len;
    Some((total, mask))
}

/// Largest payload a given mode's length field can express.
pub fn max_payload_len(mode: HeaderMode) -> u64 {
    let field_max: u64 = match mode {
        HeaderMode::ByteLsb | HeaderMode::ByteMsb | HeaderMode::EByteLsb | HeaderMode::EByteMsb => u8::MAX as u64,
        HeaderMode::WordLsb | HeaderMode::WordMsb | HeaderMode::EWordLsb | HeaderMode::EWordMsb => u16::MAX as u64,
        HeaderMode::DwordLsb | HeaderMode::DwordMsb | HeaderMode::EDwordLsb | HeaderMode::EDwordMsb => u32::MAX as u64,
        HeaderMode::DwordMask => 0x00ff_ffff,
    };
    field_max - mode.header_inc() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(mode: HeaderMode, payload_len: u32, mask: u8) {
        let header = encode_header(payload_len, mode, mask);
        let mut buf = header.as_slice().to_vec();
        buf.extend(vec![0xaa; payload_len as usize]);
        let (total, decoded_mask) = decode_available(&buf, mode).unwrap();
        assert_eq!(total, mode.header_len() + payload_len as usize);
        if mode == HeaderMode::DwordMask {
            assert_eq!(decoded_mask, mask);
        }
    }

    #[test]
    fn every_mode_round_trips() {
        let modes = [
            HeaderMode::WordLsb,
            HeaderMode::WordMsb,
            HeaderMode::DwordLsb,
            HeaderMode::DwordMsb,
            HeaderMode::ByteLsb,
            HeaderMode::ByteMsb,
            HeaderMode::EWordLsb,
            HeaderMode::EWordMsb,
            HeaderMode::EDwordLsb,
            HeaderMode::EDwordMsb,
            HeaderMode::EByteLsb,
            HeaderMode::EByteMsb,
        ];
        for mode in modes {
            round_trip(mode, 10, 0);
        }
    }

    #[test]
    fn mode_12_carries_mask_in_top_byte() {
        round_trip(HeaderMode::DwordMask, 1000, 0x42);
    }

    #[test]
    fn incomplete_header_returns_none() {
        let buf = [0u8; 1];
        assert!(decode_available(&buf, HeaderMode::DwordLsb).is_none());
    }

    #[test]
    fn inclusive_modes_subtract_header_from_length_field() {
        let header = encode_header(20, HeaderMode::EDwordLsb, 0);
        let len = u32::from_le_bytes(header.as_slice().try_into().unwrap());
        assert_eq!(len, 24); // header(4) + payload(20)
        let mut buf = header.as_slice().to_vec();
        buf.extend(vec![0u8; 20]);
        let (total, _) = decode_available(&buf, HeaderMode::EDwordLsb).unwrap();
        assert_eq!(total, 24);
    }

    #[test]
    fn byte_mode_caps_payload_at_255() {
        assert_eq!(max_payload_len(HeaderMode::ByteLsb), 255);
        assert_eq!(max_payload_len(HeaderMode::EByteLsb), 254);
    }
}
