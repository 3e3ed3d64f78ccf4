use chrono::{DateTime, Timelike, Utc};
use log::warn;
use pnet_packet::tcp::TcpFlags;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::parser::DecodedFrame;

/// The named TCP flags of a single segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpFlagSet {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
    pub psh: bool,
    pub urg: bool,
}

impl TcpFlagSet {
    /// Builds the set from the raw flags byte of a TCP header.
    pub fn from_bits(flags: u8) -> Self {
        TcpFlagSet {
            syn: flags & TcpFlags::SYN != 0,
            ack: flags & TcpFlags::ACK != 0,
            fin: flags & TcpFlags::FIN != 0,
            rst: flags & TcpFlags::RST != 0,
            psh: flags & TcpFlags::PSH != 0,
            urg: flags & TcpFlags::URG != 0,
        }
    }
}

/// One observed frame, normalized. Immutable once built.
///
/// Every optional field is present exactly when the corresponding layer was
/// decodable, and is omitted from the serialized form otherwise. A frame with
/// no decodable network layer still yields a record carrying interface, time
/// and size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketRecord {
    pub interface: String,
    /// Capture-backend timestamp (microsecond resolution), not the time the
    /// record was processed.
    pub captured_at: DateTime<Utc>,
    /// Full on-wire frame length; may exceed the bytes actually copied under
    /// the snapshot length.
    pub size_bytes: u32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub network_protocol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub source_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub destination_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub transport_protocol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub source_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub destination_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tcp_flags: Option<TcpFlagSet>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tcp_window: Option<u16>,
    /// Hex-encoded sha256 of the application payload, for dedup and
    /// correlation without storing the payload itself.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub payload_digest: Option<String>,
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
    pub day_of_week: String,
}

impl PacketRecord {
    /// Builds a record from a decoded frame.
    ///
    /// A transport layer without a network layer should not happen (the
    /// decoder walks outer layers first), but if it does the record is kept
    /// and the mismatch logged rather than the frame being discarded.
    pub fn from_frame(
        interface: &str,
        captured_at: DateTime<Utc>,
        size_bytes: u32,
        frame: &DecodedFrame,
        hash_empty_payload: bool,
    ) -> Self {
        if frame.transport.is_some() && frame.network.is_none() {
            warn!("{interface}: transport layer without a network layer, keeping record");
        }

        let network = frame.network.as_ref();
        let transport = frame.transport.as_ref();
        let payload_digest = frame.payload.as_deref().and_then(|payload| {
            if payload.is_empty() && !hash_empty_payload {
                None
            } else {
                Some(hex::encode(Sha256::digest(payload)))
            }
        });

        PacketRecord {
            interface: interface.to_string(),
            captured_at,
            size_bytes,
            network_protocol: network.map(|n| n.protocol.to_string()),
            source_address: network.map(|n| n.source.to_string()),
            destination_address: network.map(|n| n.destination.to_string()),
            transport_protocol: transport.map(|t| t.protocol.to_string()),
            source_port: transport.map(|t| t.source_port),
            destination_port: transport.map(|t| t.destination_port),
            tcp_flags: transport.and_then(|t| t.tcp_flags).map(TcpFlagSet::from_bits),
            tcp_window: transport.and_then(|t| t.tcp_window),
            payload_digest,
            hour: captured_at.hour(),
            minute: captured_at.minute(),
            second: captured_at.second(),
            day_of_week: captured_at.format("%A").to_string(),
        }
    }
}

/// An ordered group of records bounded by the rotation policy.
///
/// Append-only while open; handed to the sink and discarded once a rotation
/// bound is crossed. `start_time` is when the batch was opened, `end_time`
/// the arrival of its last record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub packet_count: usize,
    pub packets: Vec<PacketRecord>,
}

impl Batch {
    pub fn open(start_time: DateTime<Utc>) -> Self {
        Batch {
            start_time,
            end_time: start_time,
            packet_count: 0,
            packets: Vec::new(),
        }
    }

    pub fn push(&mut self, record: PacketRecord) {
        self.end_time = Utc::now();
        self.packets.push(record);
        self.packet_count += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }
}
