//! Periodic per-peer snapshot emission.
//!
//! The reactor never writes a dump itself: on each crossed deadline it
//! moves every peer's snapshot scratch into an owned job, hands the job
//! to a dedicated worker thread, clears the scratch lists and resumes.
//! The worker owns its own backend connections, so a stuck broker or a
//! slow disk cannot stall peer service.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::thread;
use std::time::Instant;

use chrono::{DateTime, Local};
use crossbeam_channel as chan;
use log::*;
use serde_json::{json, Value};
use thiserror::Error;

use telemd_common::config::{AmqpParams, KafkaParams, OutputFormat, OutputMethod};
use telemd_common::time::{Clock, DumpTimer};

use crate::backend::amqp::AmqpHost;
use crate::backend::kafka::KafkaHost;
use crate::backend::{file, render_name};
use crate::msglog::LogSeq;
use crate::peer::PeerTable;

/// Output buffer size for dump files.
const DUMP_FILE_BUFSZ: usize = 64 * 1024;

#[derive(Debug, Error)]
enum DumpError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("broker init failed for {0}")]
    BrokerInit(String),
}

/// Stable view of one peer at the snapshot point.
pub struct PeerSnapshot {
    pub addr_str: String,
    pub port: u16,
    pub records: Vec<Value>,
}

/// One snapshot hand-off from the reactor to the worker.
pub struct DumpJob {
    /// Occupied slots, in index order.
    pub snapshots: Vec<PeerSnapshot>,
    /// The worker advances its own copy of the sequence counter.
    pub seq: LogSeq,
    pub tstamp: DateTime<Local>,
    pub tstamp_str: String,
    pub period: u64,
}

/// Static configuration the worker needs to build fresh backends per job.
#[derive(Clone)]
pub struct DumpConfig {
    pub method: OutputMethod,
    pub output: OutputFormat,
    pub latest_file: Option<String>,
    pub amqp: AmqpParams,
    pub kafka: KafkaParams,
}

/// The dump scheduler: deadline tracking on the reactor side, a
/// single-worker channel to the writer thread.
pub struct DumpScheduler {
    pub timer: DumpTimer,
    period: u64,
    tx: chan::Sender<DumpJob>,
    worker: Option<thread::JoinHandle<()>>,
}

impl DumpScheduler {
    pub fn start(cfg: DumpConfig, timer: DumpTimer, period: u64) -> io::Result<Self> {
        let (tx, rx) = chan::unbounded();
        let worker = thread::Builder::new()
            .name("telemd-dump".to_owned())
            .spawn(move || worker_loop(rx, cfg))?;
        Ok(Self {
            timer,
            period,
            tx,
            worker: Some(worker),
        })
    }

    pub fn period(&self) -> u64 {
        self.period
    }

    /// Hand one snapshot job to the worker; never blocks the reactor. A
    /// dead worker is logged and the scheduler stays armed for the next
    /// deadline.
    pub fn fire(&self, job: DumpJob) {
        if self.tx.send(job).is_err() {
            warn!("unable to hand off telemetry dump job: worker is gone");
        }
    }

    /// Drop the channel and wait for the worker to drain queued jobs.
    pub fn shutdown(self) {
        let Self { tx, worker, .. } = self;
        drop(tx);
        if let Some(worker) = worker {
            worker.join().ok();
        }
    }
}

/// Move every occupied peer's scratch into an owned job and clear it;
/// this is the snapshot point, after which the reactor keeps nothing of
/// the dump state.
pub fn collect_job(peers: &mut PeerTable, seq: LogSeq, clock: &Clock, period: u64) -> DumpJob {
    let mut snapshots = Vec::new();
    for (_, peer) in peers.iter_occupied_mut() {
        let records = peer.dump.take().unwrap_or_default();
        peer.dump = Some(Vec::new());
        snapshots.push(PeerSnapshot {
            addr_str: peer.addr_str.clone(),
            port: peer.port,
            records,
        });
    }
    DumpJob {
        snapshots,
        seq,
        tstamp: clock.now(),
        tstamp_str: clock.render(),
        period,
    }
}

fn worker_loop(rx: chan::Receiver<DumpJob>, cfg: DumpConfig) {
    while let Ok(job) = rx.recv() {
        if let Err(e) = write_dump(&cfg, job) {
            error!("telemetry dump failed: {}", e);
        }
    }
}

fn write_dump(cfg: &DumpConfig, job: DumpJob) -> Result<(), DumpError> {
    let started = Instant::now();
    let now = job.tstamp.timestamp();
    let mut seq = job.seq;

    // Fresh backend connections per job, as if this were a newly spawned
    // writer process.
    let mut amqp = None;
    let mut kafka = None;
    match &cfg.method {
        OutputMethod::File(_) => {}
        OutputMethod::Amqp(_) => {
            let mut host = AmqpHost::init(cfg.amqp.clone());
            if !host.connect(now) {
                return Err(DumpError::BrokerInit("amqp".to_owned()));
            }
            amqp = Some(host);
        }
        OutputMethod::Kafka(_) => {
            let mut host = KafkaHost::init(cfg.kafka.clone());
            if !host.connect(now) {
                return Err(DumpError::BrokerInit("kafka".to_owned()));
            }
            kafka = Some(host);
        }
    }

    info!("*** dumping telemetry data - start ***");

    // JSON is the only record format this build carries.
    let OutputFormat::Json = cfg.output;

    let mut writer: Option<BufWriter<File>> = None;
    let mut last_filename = String::new();
    let mut last_addr = String::new();
    let mut peers_num = 0;

    for snap in &job.snapshots {
        let current = render_name(cfg.method.template(), &snap.addr_str, job.tstamp);

        if matches!(cfg.method, OutputMethod::File(_)) && current != last_filename {
            // Rotate: close the previous file and point the "latest" link
            // at it before opening the new one truncated.
            if writer.take().is_some() {
                if let Some(latest_template) = &cfg.latest_file {
                    let latest = render_name(latest_template, &last_addr, job.tstamp);
                    file::link_latest(&latest, &last_filename);
                }
            }
            let f = file::open_truncate(&current)?;
            writer = Some(BufWriter::with_capacity(DUMP_FILE_BUFSZ, f));
        }

        let init_msg = json!({
            "event_type": "dump_init",
            "seq": seq.next(),
            "timestamp": job.tstamp_str,
            "telemetry_node": snap.addr_str,
            "telemetry_node_port": snap.port,
            "dump_period": job.period,
        });
        emit(&mut writer, &mut amqp, &mut kafka, &current, &init_msg, now)?;

        let mut dump_elems = 0u64;
        for record in &snap.records {
            let msg = json!({
                "event_type": "dump",
                "seq": seq.next(),
                "timestamp": job.tstamp_str,
                "telemetry_node": snap.addr_str,
                "telemetry_node_port": snap.port,
                "telemetry_data": record,
            });
            emit(&mut writer, &mut amqp, &mut kafka, &current, &msg, now)?;
            dump_elems += 1;
        }

        let close_msg = json!({
            "event_type": "dump_close",
            "seq": seq.next(),
            "timestamp": job.tstamp_str,
            "telemetry_node": snap.addr_str,
            "telemetry_node_port": snap.port,
            "entries": dump_elems,
        });
        emit(&mut writer, &mut amqp, &mut kafka, &current, &close_msg, now)?;

        last_filename = current;
        last_addr = snap.addr_str.clone();
        peers_num += 1;
    }

    if let Some(mut w) = writer.take() {
        w.flush()?;
        drop(w);
        if let Some(latest_template) = &cfg.latest_file {
            let latest = render_name(latest_template, &last_addr, job.tstamp);
            file::link_latest(&latest, &last_filename);
        }
    }

    if let Some(host) = amqp.as_mut() {
        host.close(false);
    }
    if let Some(host) = kafka.as_mut() {
        host.close(false);
    }

    info!(
        "*** dumping telemetry data - end (peers: {}, et: {:?}) ***",
        peers_num,
        started.elapsed()
    );
    Ok(())
}

fn emit(
    writer: &mut Option<BufWriter<File>>,
    amqp: &mut Option<AmqpHost>,
    kafka: &mut Option<KafkaHost>,
    name: &str,
    msg: &Value,
    now: i64,
) -> Result<(), DumpError> {
    if let Some(w) = writer.as_mut() {
        writeln!(w, "{}", msg)?;
    }
    if let Some(host) = amqp.as_mut() {
        host.publish(name, &msg.to_string(), now);
    }
    if let Some(host) = kafka.as_mut() {
        host.publish(name, &msg.to_string(), now);
    }
    Ok(())
}
