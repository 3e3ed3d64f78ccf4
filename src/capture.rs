use chrono::{DateTime, Utc};
use crossbeam_channel::{Sender, TrySendError};
use log::{debug, info, warn};
use pcap::{Active, Capture};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::parser;
use crate::record::PacketRecord;
use crate::settings::{BackpressurePolicy, Settings, StrictnessMode};
use crate::shutdown::ShutdownFlag;

/// What happened to a record handed to the fan-in channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    Forwarded,
    /// Channel full under the drop-and-count policy.
    Dropped,
    /// Receiver gone: the pipeline is shutting down.
    Closed,
}

/// Applies the configured backpressure policy to one send.
pub fn forward_record(
    tx: &Sender<PacketRecord>,
    policy: BackpressurePolicy,
    record: PacketRecord,
) -> ForwardOutcome {
    match policy {
        BackpressurePolicy::Stall => match tx.send(record) {
            Ok(()) => ForwardOutcome::Forwarded,
            Err(_) => ForwardOutcome::Closed,
        },
        BackpressurePolicy::DropAndCount => match tx.try_send(record) {
            Ok(()) => ForwardOutcome::Forwarded,
            Err(TrySendError::Full(_)) => ForwardOutcome::Dropped,
            Err(TrySendError::Disconnected(_)) => ForwardOutcome::Closed,
        },
    }
}

/// Converts a capture header timestamp (seconds + microseconds) to UTC.
fn capture_timestamp(secs: i64, micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, (micros.clamp(0, 999_999) as u32) * 1000)
        .unwrap_or_else(Utc::now)
}

/// Whether the strictness mode discards this frame instead of forwarding a
/// (possibly partial) record.
fn drops_frame(strictness: StrictnessMode, decoded: &parser::DecodedFrame) -> bool {
    strictness == StrictnessMode::Ipv4OnlyStrict && !decoded.is_ipv4_with_transport()
}

/// One capture loop, bound to one interface.
///
/// Owns its capture handle exclusively; the handle is closed when the worker
/// exits. An open or filter failure kills only this worker (the caller
/// decides whether losing every interface is fatal).
pub struct CaptureWorker {
    interface: String,
    cap: Capture<Active>,
    strictness: StrictnessMode,
    backpressure: BackpressurePolicy,
    hash_empty_payload: bool,
}

impl CaptureWorker {
    /// Opens the interface with the configured snapshot length, promiscuous
    /// flag and read timeout, and attaches the filter expression.
    pub fn open(settings: &Settings, interface: &str) -> Result<Self, pcap::Error> {
        let mut cap = Capture::from_device(interface)?
            .promisc(settings.promiscuous)
            .snaplen(settings.snapshot_length)
            .timeout(settings.read_timeout_ms)
            .open()?;
        cap.filter(&settings.filter, true)?;

        Ok(CaptureWorker {
            interface: interface.to_string(),
            cap,
            strictness: settings.strictness,
            backpressure: settings.backpressure,
            hash_empty_payload: settings.hash_empty_payload,
        })
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Reads frames until shutdown is requested or the frame stream ends.
    ///
    /// The shutdown flag is checked every iteration; with no traffic the
    /// capture read timeout bounds how long that check is deferred.
    pub fn run(mut self, tx: Sender<PacketRecord>, shutdown: ShutdownFlag, dropped: Arc<AtomicU64>) {
        info!("started capturing on {}", self.interface);
        let mut dropped_here: u64 = 0;

        loop {
            if shutdown.is_set() {
                break;
            }
            let packet = match self.cap.next_packet() {
                Ok(packet) => packet,
                // No frame within the read timeout: recheck the flag.
                Err(pcap::Error::TimeoutExpired) => continue,
                Err(e) => {
                    info!("frame stream on {} ended: {e}", self.interface);
                    break;
                }
            };

            let captured_at =
                capture_timestamp(packet.header.ts.tv_sec as i64, packet.header.ts.tv_usec as i64);
            let size_bytes = packet.header.len;
            let decoded = parser::decode_frame(packet.data);

            if drops_frame(self.strictness, &decoded) {
                continue;
            }

            let record = PacketRecord::from_frame(
                &self.interface,
                captured_at,
                size_bytes,
                &decoded,
                self.hash_empty_payload,
            );
            debug!(
                "{}: {} bytes {} {} -> {}",
                self.interface,
                size_bytes,
                record.transport_protocol.as_deref().unwrap_or("?"),
                record.source_address.as_deref().unwrap_or("?"),
                record.destination_address.as_deref().unwrap_or("?"),
            );

            match forward_record(&tx, self.backpressure, record) {
                ForwardOutcome::Forwarded => {}
                ForwardOutcome::Dropped => {
                    dropped_here += 1;
                    dropped.fetch_add(1, Ordering::Relaxed);
                }
                ForwardOutcome::Closed => {
                    info!("record channel closed, stopping capture on {}", self.interface);
                    break;
                }
            }
        }

        if dropped_here > 0 {
            warn!(
                "{}: dropped {dropped_here} records on a full channel",
                self.interface,
            );
        }
        info!("capture worker for {} exiting", self.interface);
        // Dropping self closes the capture handle.
    }
}
