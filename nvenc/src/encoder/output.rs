use bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Video,
}

/// An encoded frame. The caller owns the data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub data: Bytes,
    pub pts: i64,
    pub dts: i64,
    pub keyframe: bool,
    pub kind: PacketType,
}

/// Parameter sets and SEI split out of the first packet of the stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodecHeaders {
    /// SPS and PPS, Annex-B.
    pub header: Bytes,
    pub sei: Bytes,
}
