use chrono::Utc;
use crossbeam_channel::Receiver;
use log::{error, info};
use std::fs;
use std::io::{self, BufWriter, Write};
use std::mem;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::record::{Batch, PacketRecord};
use crate::settings::Settings;

/// Bounds that close the open batch. The first bound crossed wins.
#[derive(Debug, Clone, Copy)]
pub struct RotationPolicy {
    pub max_records: usize,
    pub max_duration: Option<Duration>,
    pub max_bytes: Option<u64>,
}

impl RotationPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        RotationPolicy {
            max_records: settings.max_batch_records,
            max_duration: settings.max_batch_duration_secs.map(Duration::from_secs),
            max_bytes: settings.max_batch_bytes,
        }
    }

    /// Evaluated after every append. `serialized_bytes` is the running size
    /// of the batch's records in serialized form.
    fn should_rotate(&self, batch: &Batch, serialized_bytes: u64) -> bool {
        if batch.packet_count >= self.max_records {
            return true;
        }
        if let Some(max_duration) = self.max_duration {
            let elapsed = (batch.end_time - batch.start_time).to_std().unwrap_or_default();
            if elapsed >= max_duration {
                return true;
            }
        }
        if let Some(max_bytes) = self.max_bytes {
            if serialized_bytes >= max_bytes {
                return true;
            }
        }
        false
    }
}

/// Destination for flushed batches.
pub trait BatchSink {
    fn write(&mut self, batch: &Batch) -> io::Result<()>;
}

/// Writes each batch as one pretty-printed JSON file. File names carry a
/// monotonically increasing sequence number plus the batch start time, so
/// rotations within a run never overwrite each other.
pub struct JsonFileSink {
    dir: PathBuf,
    sequence: u64,
}

impl JsonFileSink {
    pub fn new<P: AsRef<Path>>(dir: P) -> io::Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(JsonFileSink {
            dir: dir.as_ref().to_path_buf(),
            sequence: 0,
        })
    }
}

impl BatchSink for JsonFileSink {
    fn write(&mut self, batch: &Batch) -> io::Result<()> {
        self.sequence += 1;
        let filename = format!(
            "network_data_{}_{}.json",
            self.sequence,
            batch.start_time.format("%Y-%m-%d_%H-%M-%S"),
        );
        let path = self.dir.join(filename);
        let file = fs::File::create(&path)?;
        let mut out = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut out, batch)?;
        out.flush()?;
        info!("saved {} records to {}", batch.packet_count, path.display());
        Ok(())
    }
}

/// Counters reported by the writer when the pipeline drains.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriterStats {
    pub records_written: u64,
    pub batches_flushed: u64,
    /// Batches lost to storage failures. Dropping instead of retrying is the
    /// documented lossy-on-storage-failure policy: it bounds memory.
    pub batches_dropped: u64,
    pub records_lost: u64,
}

/// The single consumer of the fan-in channel.
///
/// Appends every received record to the open batch, rotating whenever a
/// policy bound is crossed. Blocks until the channel is closed and drained,
/// then flushes the final partial batch.
pub fn run_writer<S: BatchSink>(
    rx: Receiver<PacketRecord>,
    policy: RotationPolicy,
    mut sink: S,
    progress_interval: u64,
) -> WriterStats {
    let mut stats = WriterStats::default();
    let mut batch = Batch::open(Utc::now());
    let mut batch_bytes: u64 = 0;
    let mut received: u64 = 0;
    let started = Instant::now();

    while let Ok(record) = rx.recv() {
        batch_bytes += serde_json::to_vec(&record).map(|b| b.len() as u64).unwrap_or(0);
        batch.push(record);
        received += 1;

        if progress_interval > 0 && received % progress_interval == 0 {
            let rate = received as f64 / started.elapsed().as_secs_f64().max(f64::EPSILON);
            info!(
                "received {received} records ({rate:.0}/s), open batch holds {}",
                batch.packet_count,
            );
        }

        if policy.should_rotate(&batch, batch_bytes) {
            let full = mem::replace(&mut batch, Batch::open(Utc::now()));
            flush(&mut sink, full, &mut stats);
            batch_bytes = 0;
        }
    }

    // Channel closed and drained: every producer has exited.
    if !batch.is_empty() {
        flush(&mut sink, batch, &mut stats);
    }
    info!(
        "writer done: {} records in {} batches, {} batches dropped on storage failure",
        stats.records_written, stats.batches_flushed, stats.batches_dropped,
    );
    stats
}

fn flush<S: BatchSink>(sink: &mut S, batch: Batch, stats: &mut WriterStats) {
    let count = batch.packet_count as u64;
    match sink.write(&batch) {
        Ok(()) => {
            stats.batches_flushed += 1;
            stats.records_written += count;
        }
        Err(e) => {
            // Lossy by design: the failed batch is dropped, not re-buffered.
            error!("failed to write batch of {count} records, dropping it: {e}");
            stats.batches_dropped += 1;
            stats.records_lost += count;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::decode_frame;
    use crate::record::PacketRecord;
    use chrono::{DateTime, TimeZone, Utc};
    use crossbeam_channel::bounded;
    use pnet_packet::ethernet::{EtherTypes, MutableEthernetPacket};
    use pnet_packet::ip::IpNextHeaderProtocols;
    use pnet_packet::ipv4::MutableIpv4Packet;
    use pnet_packet::tcp::{MutableTcpPacket, TcpFlags};
    use std::collections::HashSet;
    use std::net::Ipv4Addr;
    use std::sync::{Arc, Mutex};
    use std::thread;

    #[derive(Clone, Default)]
    struct MemorySink {
        batches: Arc<Mutex<Vec<Batch>>>,
    }

    impl BatchSink for MemorySink {
        fn write(&mut self, batch: &Batch) -> io::Result<()> {
            self.batches.lock().unwrap().push(batch.clone());
            Ok(())
        }
    }

    /// Fails the first `failures` writes, then delegates to a MemorySink.
    struct FailingSink {
        failures: usize,
        inner: MemorySink,
    }

    impl BatchSink for FailingSink {
        fn write(&mut self, batch: &Batch) -> io::Result<()> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(io::Error::new(io::ErrorKind::Other, "storage unavailable"));
            }
            self.inner.write(batch)
        }
    }

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 3, 14, 30, 45).unwrap()
    }

    fn record(interface: &str, size: u32) -> PacketRecord {
        PacketRecord::from_frame(
            interface,
            ts(),
            size,
            &crate::parser::DecodedFrame {
                network: None,
                transport: None,
                payload: None,
            },
            false,
        )
    }

    fn count_only(max_records: usize) -> RotationPolicy {
        RotationPolicy {
            max_records,
            max_duration: None,
            max_bytes: None,
        }
    }

    /// Pre-fills the channel, drops the sender, and runs the writer on the
    /// current thread; the writer returns once the channel drains.
    fn run_with_records(
        records: Vec<PacketRecord>,
        policy: RotationPolicy,
    ) -> (Vec<Batch>, WriterStats) {
        let (tx, rx) = bounded(records.len().max(1));
        for record in records {
            tx.send(record).unwrap();
        }
        drop(tx);

        let sink = MemorySink::default();
        let batches = Arc::clone(&sink.batches);
        let stats = run_writer(rx, policy, sink, 0);
        let batches = batches.lock().unwrap().clone();
        (batches, stats)
    }

    #[test]
    fn test_rotates_exactly_at_max_records() {
        let records = (0..7).map(|i| record("eth0", i)).collect();
        let (batches, stats) = run_with_records(records, count_only(3));

        let counts: Vec<usize> = batches.iter().map(|b| b.packet_count).collect();
        assert_eq!(counts, vec![3, 3, 1]);
        assert_eq!(stats.records_written, 7);
        assert_eq!(stats.batches_flushed, 3);
        // Under a count-only policy no batch ever exceeds the bound.
        assert!(batches.iter().all(|b| b.packet_count <= 3));
    }

    #[test]
    fn test_final_partial_batch_flushed_on_close() {
        let records = (0..2).map(|i| record("eth0", i)).collect();
        let (batches, stats) = run_with_records(records, count_only(10));

        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].packet_count, 2);
        assert_eq!(stats.records_written, 2);
    }

    #[test]
    fn test_no_records_no_files() {
        let (batches, stats) = run_with_records(Vec::new(), count_only(10));
        assert!(batches.is_empty());
        assert_eq!(stats, WriterStats::default());
    }

    #[test]
    fn test_byte_bound_rotates_every_record() {
        let records = (0..3).map(|i| record("eth0", i)).collect();
        let policy = RotationPolicy {
            max_records: 1000,
            max_duration: None,
            max_bytes: Some(1),
        };
        let (batches, _) = run_with_records(records, policy);

        let counts: Vec<usize> = batches.iter().map(|b| b.packet_count).collect();
        assert_eq!(counts, vec![1, 1, 1]);
    }

    #[test]
    fn test_time_bound_rotates_on_append() {
        // Zero max duration: every append crosses the bound.
        let records = (0..2).map(|i| record("eth0", i)).collect();
        let policy = RotationPolicy {
            max_records: 1000,
            max_duration: Some(Duration::ZERO),
            max_bytes: None,
        };
        let (batches, _) = run_with_records(records, policy);

        let counts: Vec<usize> = batches.iter().map(|b| b.packet_count).collect();
        assert_eq!(counts, vec![1, 1]);
    }

    #[test]
    fn test_storage_failure_drops_batch_and_continues() {
        let (tx, rx) = bounded(4);
        for i in 0..4 {
            tx.send(record("eth0", i)).unwrap();
        }
        drop(tx);

        let inner = MemorySink::default();
        let written = Arc::clone(&inner.batches);
        let sink = FailingSink { failures: 1, inner };
        let stats = run_writer(rx, count_only(2), sink, 0);

        // First batch of 2 lost to the failure, second batch of 2 written.
        assert_eq!(stats.batches_dropped, 1);
        assert_eq!(stats.records_lost, 2);
        assert_eq!(stats.batches_flushed, 1);
        assert_eq!(stats.records_written, 2);
        assert_eq!(written.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_shutdown_completeness_across_producers() {
        // Records enqueued before the producers stop all end up in exactly
        // one flushed batch: no loss, no duplication. Order is only
        // guaranteed per interface.
        let (tx, rx) = bounded(64);
        let mut producers = Vec::new();
        for p in 0..3 {
            let tx = tx.clone();
            producers.push(thread::spawn(move || {
                let interface = format!("eth{p}");
                for i in 0..50u32 {
                    tx.send(record(&interface, i)).unwrap();
                }
            }));
        }
        drop(tx);

        let sink = MemorySink::default();
        let batches = Arc::clone(&sink.batches);
        let writer = thread::spawn(move || run_writer(rx, count_only(7), sink, 0));
        for producer in producers {
            producer.join().unwrap();
        }
        let stats = writer.join().unwrap();

        assert_eq!(stats.records_written, 150);
        let batches = batches.lock().unwrap();
        let mut seen: HashSet<(String, u32)> = HashSet::new();
        let mut per_interface: std::collections::HashMap<String, Vec<u32>> = Default::default();
        for batch in batches.iter() {
            assert!(batch.packet_count <= 7);
            for rec in &batch.packets {
                assert!(
                    seen.insert((rec.interface.clone(), rec.size_bytes)),
                    "record duplicated across batches",
                );
                per_interface
                    .entry(rec.interface.clone())
                    .or_default()
                    .push(rec.size_bytes);
            }
        }
        assert_eq!(seen.len(), 150);
        // FIFO within each producer.
        for sizes in per_interface.values() {
            assert_eq!(*sizes, (0..50).collect::<Vec<u32>>());
        }
    }

    #[test]
    fn test_json_file_sink_unique_names() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = JsonFileSink::new(dir.path()).unwrap();

        let mut batch = Batch::open(ts());
        batch.push(record("eth0", 60));
        // Same start time twice: the sequence number keeps the names apart.
        sink.write(&batch).unwrap();
        sink.write(&batch).unwrap();

        let mut names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert_eq!(names.len(), 2);
        assert!(names[0].starts_with("network_data_1_"));
        assert!(names[1].starts_with("network_data_2_"));

        // The file parses back to the same batch.
        let raw = fs::read_to_string(dir.path().join(&names[0])).unwrap();
        let parsed: Batch = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, batch);
    }

    #[test]
    fn test_single_syn_frame_scenario() {
        // One TCP frame on eth0: SYN, 10.0.0.1:443 -> 10.0.0.2:51000, empty
        // payload, permissive decoding, rotation after one record.
        let mut buffer = vec![0u8; 14 + 20 + 20];
        {
            let mut ethernet = MutableEthernetPacket::new(&mut buffer).unwrap();
            ethernet.set_ethertype(EtherTypes::Ipv4);
        }
        {
            let mut ipv4 = MutableIpv4Packet::new(&mut buffer[14..]).unwrap();
            ipv4.set_version(4);
            ipv4.set_header_length(5);
            ipv4.set_total_length(40);
            ipv4.set_next_level_protocol(IpNextHeaderProtocols::Tcp);
            ipv4.set_source(Ipv4Addr::new(10, 0, 0, 1));
            ipv4.set_destination(Ipv4Addr::new(10, 0, 0, 2));
        }
        {
            let mut tcp = MutableTcpPacket::new(&mut buffer[34..]).unwrap();
            tcp.set_source(443);
            tcp.set_destination(51000);
            tcp.set_data_offset(5);
            tcp.set_flags(TcpFlags::SYN);
        }

        let decoded = decode_frame(&buffer);
        let record = PacketRecord::from_frame("eth0", ts(), buffer.len() as u32, &decoded, false);
        let (batches, stats) = run_with_records(vec![record], count_only(1));

        assert_eq!(stats.batches_flushed, 1);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].packet_count, 1);

        let rec = &batches[0].packets[0];
        assert_eq!(rec.interface, "eth0");
        assert_eq!(rec.source_port, Some(443));
        assert_eq!(rec.destination_port, Some(51000));
        let flags = rec.tcp_flags.expect("tcp flags");
        assert!(flags.syn);
        assert!(!flags.ack);
        assert!(!flags.fin);
        // Empty payload: digest omitted under the default configuration.
        assert_eq!(rec.payload_digest, None);
    }
}
