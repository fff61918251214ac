//! Annex-B helpers for H.264 bitstreams.

use bytes::{BufMut, Bytes, BytesMut};

const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// NAL unit types that are split out of the first packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalUnitType {
    Sei,
    Sps,
    Pps,
    Other(u8),
}

impl NalUnitType {
    /// Reads the type from the first byte of a NAL unit.
    #[inline]
    pub fn of(nalu: &[u8]) -> Option<Self> {
        let header = *nalu.first()?;
        Some(match header & 0x1f {
            6 => NalUnitType::Sei,
            7 => NalUnitType::Sps,
            8 => NalUnitType::Pps,
            other => NalUnitType::Other(other),
        })
    }
}

/// Iterator over NALUs. The returned `&[u8]`s does not include the NALU delimiter.
pub struct NaluChunks<'a> {
    data: &'a [u8],
    start: usize,
}

impl<'a> Iterator for NaluChunks<'a> {
    type Item = &'a [u8];

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        if self.start == self.data.len() {
            None
        } else {
            let (end, next_start) = next_ind(self.data, self.start);
            let slice = &self.data[self.start..end];
            self.start = next_start;
            Some(slice)
        }
    }
}

/// Returns (end of the current NALU, start of the next NALU).
#[inline]
fn next_ind(data: &[u8], start: usize) -> (usize, usize) {
    let mut zero_count = 0;

    for (i, &b) in data.iter().enumerate().skip(start) {
        if b == 0 {
            zero_count += 1;
            continue;
        } else if b == 1 && zero_count >= 2 {
            return (i - zero_count, i + 1);
        }
        zero_count = 0
    }
    (data.len(), data.len())
}

/// Returns an iterator over the NALU bytes of `data`.
#[inline]
pub fn nalu_chunks(data: &[u8]) -> NaluChunks {
    let (_, start) = next_ind(data, 0);
    NaluChunks { data, start }
}

/// A bitstream split into its parameter sets, its SEI messages and the rest.
///
/// Every part is Annex-B with 4-byte start codes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AvcParts {
    pub packet: Bytes,
    pub header: Bytes,
    pub sei: Bytes,
}

/// Moves SPS/PPS into `header` and SEI into `sei`. Everything else stays in `packet` in its
/// original order.
pub fn extract_headers(data: &[u8]) -> AvcParts {
    let mut packet = BytesMut::with_capacity(data.len());
    let mut header = BytesMut::new();
    let mut sei = BytesMut::new();

    for nalu in nalu_chunks(data).filter(|nalu| !nalu.is_empty()) {
        let dst = match NalUnitType::of(nalu) {
            Some(NalUnitType::Sps | NalUnitType::Pps) => &mut header,
            Some(NalUnitType::Sei) => &mut sei,
            _ => &mut packet,
        };
        dst.put_slice(&START_CODE);
        dst.put_slice(nalu);
    }

    AvcParts {
        packet: packet.freeze(),
        header: header.freeze(),
        sei: sei.freeze(),
    }
}
