use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crossbeam_channel::bounded;
use log::{error, info, warn};
use pcap::Device;

use netlogger::{
    CaptureWorker, Coordinator, JsonFileSink, PacketRecord, RotationPolicy, Settings, ShutdownFlag,
    run_writer,
};

fn main() -> Result<(), Box<dyn Error>> {
    let settings = Settings::new()?;

    env_logger::Builder::new()
        .parse_filters(&settings.log_level)
        .init();

    let interfaces = resolve_interfaces(&settings)?;
    if interfaces.is_empty() {
        error!("no capture devices found, try running with elevated privileges");
        return Err("no capture devices found".into());
    }

    // One bounded queue carries records from every worker to the writer.
    let (tx, rx) = bounded::<PacketRecord>(settings.channel_capacity);

    // Open every interface before spawning anything. A failed open only
    // loses that interface; losing all of them is fatal.
    let mut workers = Vec::new();
    for interface in &interfaces {
        match CaptureWorker::open(&settings, interface) {
            Ok(worker) => workers.push(worker),
            Err(e) => warn!("skipping {interface}: {e}"),
        }
    }
    if workers.is_empty() {
        error!("every capture interface failed to open");
        return Err("no capture interface could be opened".into());
    }

    let shutdown = ShutdownFlag::install();
    let dropped = Arc::new(AtomicU64::new(0));

    let mut worker_handles = Vec::new();
    for worker in workers {
        let interface = worker.interface().to_string();
        let tx = tx.clone();
        let shutdown = shutdown.clone();
        let dropped = Arc::clone(&dropped);
        let handle = thread::spawn(move || worker.run(tx, shutdown, dropped));
        worker_handles.push((interface, handle));
    }
    // The workers now hold the only senders: the channel disconnects when
    // the last worker exits, never while one can still send.
    drop(tx);

    let policy = RotationPolicy::from_settings(&settings);
    let sink = JsonFileSink::new(&settings.output_dir)?;
    let progress_interval = settings.progress_interval;
    let writer_handle = thread::spawn(move || run_writer(rx, policy, sink, progress_interval));

    info!(
        "capturing on {} interface(s), press Ctrl+C to stop",
        worker_handles.len(),
    );

    let stats = Coordinator::new(worker_handles, writer_handle).wait();

    let dropped_total = dropped.load(Ordering::Relaxed);
    if dropped_total > 0 {
        warn!("{dropped_total} records dropped on a full channel");
    }
    info!(
        "captured {} records into {} files ({} records lost to storage failures)",
        stats.records_written, stats.batches_flushed, stats.records_lost,
    );
    Ok(())
}

/// The configured interface list, or every device the backend knows about.
fn resolve_interfaces(settings: &Settings) -> Result<Vec<String>, pcap::Error> {
    if !settings.interfaces.is_empty() {
        return Ok(settings.interfaces.clone());
    }

    let devices = Device::list()?;
    info!("no interfaces configured, capturing on all {} devices", devices.len());
    for device in &devices {
        info!(
            "found device {} ({})",
            device.name,
            device.desc.as_deref().unwrap_or("no description"),
        );
    }
    Ok(devices.into_iter().map(|device| device.name).collect())
}
