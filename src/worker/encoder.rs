use super::InboundFrame;

/// One encoded access unit ready for the packet slot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EncodedPacket {
    pub data: Vec<u8>,
    pub timestamp_ns: u64,
    pub is_idr: bool,
}

pub trait FrameEncoder: Send {
    fn name(&self) -> &str;

    /// Encodes one frame. Encoders with internal delay may return nothing for
    /// a frame, or several packets at once.
    fn encode(&mut self, frame: &InboundFrame<'_>) -> anyhow::Result<Vec<EncodedPacket>>;
}

impl<E: FrameEncoder + ?Sized> FrameEncoder for Box<E> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn encode(&mut self, frame: &InboundFrame<'_>) -> anyhow::Result<Vec<EncodedPacket>> {
        (**self).encode(frame)
    }
}

/// Joins the packets produced for one frame into the single packet slot.
/// The timestamp of the first packet wins; the result is IDR if any part is.
pub fn merge_packets(mut packets: Vec<EncodedPacket>) -> Option<EncodedPacket> {
    match packets.len() {
        0 => None,
        1 => packets.pop(),
        _ => {
            let total = packets.iter().map(|p| p.data.len()).sum();
            let mut merged = EncodedPacket {
                data: Vec::with_capacity(total),
                timestamp_ns: packets[0].timestamp_ns,
                is_idr: false,
            };
            for packet in packets {
                merged.data.extend_from_slice(&packet.data);
                merged.is_idr |= packet.is_idr;
            }
            Some(merged)
        }
    }
}

/// Echoes every frame back as a packet without compressing it.
#[derive(Debug, Clone, Default)]
pub struct PassthroughEncoder {
    /// Output length; the payload is truncated or zero padded to it.
    pub declared_size: Option<usize>,
    pub force_idr: bool,
}

impl PassthroughEncoder {
    pub fn new(declared_size: Option<usize>, force_idr: bool) -> Self {
        Self {
            declared_size,
            force_idr,
        }
    }
}

impl FrameEncoder for PassthroughEncoder {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn encode(&mut self, frame: &InboundFrame<'_>) -> anyhow::Result<Vec<EncodedPacket>> {
        let mut data = frame.data.to_vec();
        if let Some(size) = self.declared_size {
            data.resize(size, 0);
        }
        Ok(vec![EncodedPacket {
            data,
            timestamp_ns: frame.header.timestamp_ns,
            is_idr: self.force_idr || frame.header.insert_idr,
        }])
    }
}
