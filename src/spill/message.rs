//! Scratch-memory message shapes for spill stores and fills.
//!
//! Two strategies, selected by platform: legacy HWord scratch block messages
//! (row offsets in 32-byte units, power-of-two block heights) and LSC
//! load/store (byte-addressed, any row count up to the message cap).

use smallvec::SmallVec;

use crate::ir::types::ROW_BYTES;
use crate::platform::Platform;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScratchMsg {
    /// Legacy HWord scratch block read/write. Offset in 32-byte units,
    /// heights restricted to 1/2/4/8 rows.
    Block {
        offset_hwords: u32,
        rows: u8,
        write: bool,
    },
    /// LSC untyped load/store against the scratch surface, byte-addressed.
    Lsc {
        offset_bytes: u32,
        bytes: u32,
        write: bool,
    },
}

impl ScratchMsg {
    pub fn offset_bytes(&self) -> u32 {
        match *self {
            ScratchMsg::Block { offset_hwords, .. } => offset_hwords * ROW_BYTES,
            ScratchMsg::Lsc { offset_bytes, .. } => offset_bytes,
        }
    }

    /// GRF rows moved by this message.
    pub fn rows(&self) -> u32 {
        match *self {
            ScratchMsg::Block { rows, .. } => rows as u32,
            ScratchMsg::Lsc { bytes, .. } => bytes.div_ceil(ROW_BYTES),
        }
    }

    pub fn is_write(&self) -> bool {
        match *self {
            ScratchMsg::Block { write, .. } | ScratchMsg::Lsc { write, .. } => write,
        }
    }
}

/// Split a row count into legal legacy block heights, largest first.
/// Heights are powers of two capped by the platform message limit, so
/// 7 rows becomes 4 + 2 + 1.
pub fn block_heights(mut rows: u32, max_msg_rows: u8) -> SmallVec<[u8; 4]> {
    let mut cap = 1u32;
    while cap * 2 <= max_msg_rows as u32 && cap * 2 <= 8 {
        cap *= 2;
    }
    let mut out = SmallVec::new();
    while rows > 0 {
        let mut h = cap;
        while h > rows {
            h /= 2;
        }
        out.push(h as u8);
        rows -= h;
    }
    out
}

/// Messages covering `rows` GRF rows at scratch byte offset `byte_off`,
/// as `(row_offset_within_range, message)` chunks.
pub fn build_row_msgs(
    platform: &Platform,
    byte_off: u32,
    rows: u32,
    write: bool,
) -> SmallVec<[(u32, ScratchMsg); 4]> {
    debug_assert_eq!(byte_off % ROW_BYTES, 0, "scratch ranges are row-aligned");
    let mut out = SmallVec::new();
    if platform.has_lsc {
        let mut done = 0u32;
        while done < rows {
            let n = (rows - done).min(platform.max_msg_rows as u32);
            out.push((
                done,
                ScratchMsg::Lsc {
                    offset_bytes: byte_off + done * ROW_BYTES,
                    bytes: n * ROW_BYTES,
                    write,
                },
            ));
            done += n;
        }
    } else {
        let mut done = 0u32;
        for h in block_heights(rows, platform.max_msg_rows) {
            out.push((
                done,
                ScratchMsg::Block {
                    offset_hwords: byte_off / ROW_BYTES + done,
                    rows: h,
                    write,
                },
            ));
            done += h as u32;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heights_are_powers_of_two() {
        assert_eq!(block_heights(7, 8).as_slice(), &[4, 2, 1]);
        assert_eq!(block_heights(8, 8).as_slice(), &[8]);
        assert_eq!(block_heights(3, 2).as_slice(), &[2, 1]);
        assert!(block_heights(0, 8).is_empty());
    }

    #[test]
    fn legacy_chunks_carry_hword_offsets() {
        let p = Platform::default(); // has_lsc = false
        let msgs = build_row_msgs(&p, 64, 3, true);
        assert_eq!(msgs.len(), 2);
        assert_eq!(
            msgs[0],
            (
                0,
                ScratchMsg::Block {
                    offset_hwords: 2,
                    rows: 2,
                    write: true
                }
            )
        );
        assert_eq!(msgs[1].1.offset_bytes(), 64 + 2 * ROW_BYTES);
    }

    #[test]
    fn lsc_takes_arbitrary_counts() {
        let mut p = Platform::default();
        p.has_lsc = true;
        let msgs = build_row_msgs(&p, 0, 7, false);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].1.rows(), 7);
        assert!(!msgs[0].1.is_write());
    }
}
