//! Binary wire codec for telemetry and dispatch frames.
//!
//! Layout is fixed-field, little-endian, `f32` for all readings. See the
//! frame diagrams in the component spec for the exact byte offsets; this
//! module is a direct transcription of those diagrams plus the decode
//! error contract.

use std::fmt;

/// Telemetry frame magic: endpoint -> controller.
pub const TELEMETRY_MAGIC: u32 = 0x4752_4944;
/// Dispatch frame magic: controller -> endpoint.
pub const DISPATCH_MAGIC: u32 = 0x4449_5350;

/// Maximum node records permitted in either frame.
pub const MAX_NODES: usize = 16;

const TELEMETRY_HEADER_LEN: usize = 4 + 4 + 1; // magic + timestamp + node_count
const TELEMETRY_RECORD_LEN: usize = 1 + 1 + 4 + 4; // id, type, demand, fulfillment
const DISPATCH_HEADER_LEN: usize = 4 + 1; // magic + node_count
const DISPATCH_RECORD_LEN: usize = 1 + 4 + 1; // id, supply, source

/// Role tag carried on every node reading, kept for forward compatibility
/// with deployments that mix power-only and power+consumer node sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum NodeRole {
    Power = 0,
    Consumer = 1,
}

impl NodeRole {
    fn from_byte(b: u8) -> Result<Self, WireError> {
        match b {
            0 => Ok(Self::Power),
            1 => Ok(Self::Consumer),
            other => Err(WireError::BadNodeType(other)),
        }
    }
}

/// One node reading inside a `TelemetryFrame`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetryNode {
    pub id: u8,
    pub role: NodeRole,
    pub demand: f32,
    pub fulfillment: f32,
}

/// One decoded telemetry reading.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryFrame {
    pub timestamp_ms: u32,
    pub nodes: Vec<TelemetryNode>,
}

/// One dispatch command triple inside a `DispatchFrame`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispatchNode {
    pub node_id: u8,
    pub supply: f32,
    pub source_id: u8,
}

/// One encoded dispatch command set.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchFrame {
    pub nodes: Vec<DispatchNode>,
}

/// Errors from decoding either frame type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WireError {
    BadMagic(u32),
    TruncatedFrame,
    TooManyNodes(usize),
    OutOfRangeSupply(f32),
    BadNodeType(u8),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMagic(m) => write!(f, "bad magic: 0x{m:08X}"),
            Self::TruncatedFrame => write!(f, "truncated frame"),
            Self::TooManyNodes(n) => write!(f, "too many nodes: {n} (max {MAX_NODES})"),
            Self::OutOfRangeSupply(s) => write!(f, "supply out of range [0,1]: {s}"),
            Self::BadNodeType(t) => write!(f, "bad node type byte: {t}"),
        }
    }
}

impl std::error::Error for WireError {}

impl TelemetryFrame {
    /// Exact encoded length in bytes for this frame.
    pub fn encoded_len(&self) -> usize {
        TELEMETRY_HEADER_LEN + self.nodes.len() * TELEMETRY_RECORD_LEN
    }

    /// Encode into `buf`, returning the number of bytes written.
    ///
    /// `buf` must be at least `encoded_len()` bytes; the encoder never
    /// allocates.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, WireError> {
        if self.nodes.len() > MAX_NODES {
            return Err(WireError::TooManyNodes(self.nodes.len()));
        }
        let len = self.encoded_len();
        if buf.len() < len {
            return Err(WireError::TruncatedFrame);
        }

        buf[0..4].copy_from_slice(&TELEMETRY_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&self.timestamp_ms.to_le_bytes());
        buf[8] = self.nodes.len() as u8;

        let mut off = TELEMETRY_HEADER_LEN;
        for n in &self.nodes {
            buf[off] = n.id;
            buf[off + 1] = n.role as u8;
            buf[off + 2..off + 6].copy_from_slice(&n.demand.to_le_bytes());
            buf[off + 6..off + 10].copy_from_slice(&n.fulfillment.to_le_bytes());
            off += TELEMETRY_RECORD_LEN;
        }

        Ok(len)
    }

    /// Decode a telemetry frame from `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < TELEMETRY_HEADER_LEN {
            return Err(WireError::TruncatedFrame);
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != TELEMETRY_MAGIC {
            return Err(WireError::BadMagic(magic));
        }
        let timestamp_ms = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        let node_count = buf[8] as usize;
        if node_count > MAX_NODES {
            return Err(WireError::TooManyNodes(node_count));
        }
        let need = TELEMETRY_HEADER_LEN + node_count * TELEMETRY_RECORD_LEN;
        if buf.len() < need {
            return Err(WireError::TruncatedFrame);
        }

        let mut nodes = Vec::with_capacity(node_count);
        let mut off = TELEMETRY_HEADER_LEN;
        for _ in 0..node_count {
            let id = buf[off];
            let role = NodeRole::from_byte(buf[off + 1])?;
            let demand = f32::from_le_bytes(buf[off + 2..off + 6].try_into().unwrap());
            let fulfillment = f32::from_le_bytes(buf[off + 6..off + 10].try_into().unwrap());
            nodes.push(TelemetryNode {
                id,
                role,
                demand,
                fulfillment,
            });
            off += TELEMETRY_RECORD_LEN;
        }

        Ok(Self {
            timestamp_ms,
            nodes,
        })
    }
}

impl DispatchFrame {
    pub fn encoded_len(&self) -> usize {
        DISPATCH_HEADER_LEN + self.nodes.len() * DISPATCH_RECORD_LEN
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, WireError> {
        if self.nodes.len() > MAX_NODES {
            return Err(WireError::TooManyNodes(self.nodes.len()));
        }
        for n in &self.nodes {
            if !(0.0..=1.0).contains(&n.supply) {
                return Err(WireError::OutOfRangeSupply(n.supply));
            }
        }
        let len = self.encoded_len();
        if buf.len() < len {
            return Err(WireError::TruncatedFrame);
        }

        buf[0..4].copy_from_slice(&DISPATCH_MAGIC.to_le_bytes());
        buf[4] = self.nodes.len() as u8;

        let mut off = DISPATCH_HEADER_LEN;
        for n in &self.nodes {
            buf[off] = n.node_id;
            buf[off + 1..off + 5].copy_from_slice(&n.supply.to_le_bytes());
            buf[off + 5] = n.source_id;
            off += DISPATCH_RECORD_LEN;
        }

        Ok(len)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < DISPATCH_HEADER_LEN {
            return Err(WireError::TruncatedFrame);
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != DISPATCH_MAGIC {
            return Err(WireError::BadMagic(magic));
        }
        let node_count = buf[4] as usize;
        if node_count > MAX_NODES {
            return Err(WireError::TooManyNodes(node_count));
        }
        let need = DISPATCH_HEADER_LEN + node_count * DISPATCH_RECORD_LEN;
        if buf.len() < need {
            return Err(WireError::TruncatedFrame);
        }

        let mut nodes = Vec::with_capacity(node_count);
        let mut off = DISPATCH_HEADER_LEN;
        for _ in 0..node_count {
            let node_id = buf[off];
            let supply = f32::from_le_bytes(buf[off + 1..off + 5].try_into().unwrap());
            if !(0.0..=1.0).contains(&supply) {
                return Err(WireError::OutOfRangeSupply(supply));
            }
            let source_id = buf[off + 5];
            nodes.push(DispatchNode {
                node_id,
                supply,
                source_id,
            });
            off += DISPATCH_RECORD_LEN;
        }

        Ok(Self { nodes })
    }
}

/// Scan `buf` for the next valid magic (either frame type), returning the
/// byte offset it starts at. Used by the Endpoint Link reader to
/// resynchronize after a corrupt frame without discarding more bytes than
/// necessary.
pub fn find_next_magic(buf: &[u8]) -> Option<usize> {
    if buf.len() < 4 {
        return None;
    }
    for i in 0..=buf.len() - 4 {
        let word = u32::from_le_bytes(buf[i..i + 4].try_into().unwrap());
        if word == TELEMETRY_MAGIC || word == DISPATCH_MAGIC {
            return Some(i);
        }
    }
    None
}
