//! Message-log channel: per-peer, per-event streaming output.

use std::fs::File;
use std::io::{LineWriter, Write};

use log::*;
use serde_json::{json, Value};

use telemd_common::config::{AmqpParams, KafkaParams, OutputFormat, OutputMethod};
use telemd_common::time::Clock;

use crate::backend::amqp::AmqpHost;
use crate::backend::kafka::KafkaHost;
use crate::backend::{file, render_name};
use crate::peer::{Peer, PeerTable};

/// Monotone sequence over every record emitted by this instance. The
/// first record is numbered 1; wrapping is not expected within a run.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSeq(u64);

impl LogSeq {
    pub fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(1);
        self.0
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

/// Per-peer log destination: a line-buffered file, or the rendered
/// routing key / topic for the channel's broker.
pub struct PeerLog {
    pub file: Option<LineWriter<File>>,
    /// Rendered file path (file backend) or routing key / topic (brokers).
    pub name: String,
}

/// The message-log sink. Exactly one backend is active per instance.
pub struct MsgLog {
    method: OutputMethod,
    output: OutputFormat,
    amqp: Option<AmqpHost>,
    kafka: Option<KafkaHost>,
}

impl MsgLog {
    pub fn new(
        method: OutputMethod,
        output: OutputFormat,
        amqp_params: AmqpParams,
        kafka_params: KafkaParams,
        now: i64,
    ) -> Self {
        let mut amqp = None;
        let mut kafka = None;
        match &method {
            OutputMethod::File(_) => {}
            OutputMethod::Amqp(_) => {
                let mut host = AmqpHost::init(amqp_params);
                host.connect(now);
                amqp = Some(host);
            }
            OutputMethod::Kafka(_) => {
                let mut host = KafkaHost::init(kafka_params);
                host.connect(now);
                kafka = Some(host);
            }
        }
        Self {
            method,
            output,
            amqp,
            kafka,
        }
    }

    /// Attach a log destination to a freshly accepted peer.
    pub fn init_peer(&mut self, peer: &mut Peer, clock: &Clock) {
        let name = render_name(self.method.template(), &peer.addr_str, clock.now());
        let file = match &self.method {
            OutputMethod::File(_) => match file::open_append(&name) {
                Ok(f) => Some(LineWriter::new(f)),
                Err(e) => {
                    warn!("[{}] unable to open {}: {}", peer.addr_str, name, e);
                    None
                }
            },
            OutputMethod::Amqp(_) | OutputMethod::Kafka(_) => None,
        };
        peer.log = Some(PeerLog { file, name });
    }

    /// Emit one record for a peer.
    pub fn log(&mut self, seq: &mut LogSeq, peer: &mut Peer, data: Value, clock: &Clock) {
        let log = match peer.log.as_mut() {
            Some(log) => log,
            None => return,
        };

        let OutputFormat::Json = self.output;
        let msg = json!({
            "event_type": "log",
            "seq": seq.next(),
            "timestamp": clock.render(),
            "telemetry_node": peer.addr_str,
            "telemetry_node_port": peer.port,
            "telemetry_data": data,
        });

        match &self.method {
            OutputMethod::File(_) => {
                if let Some(f) = log.file.as_mut() {
                    if let Err(e) = writeln!(f, "{}", msg) {
                        warn!("[{}] unable to write {}: {}", peer.addr_str, log.name, e);
                    }
                }
            }
            OutputMethod::Amqp(_) => {
                if let Some(amqp) = self.amqp.as_mut() {
                    amqp.publish(&log.name, &msg.to_string(), clock.secs());
                }
            }
            OutputMethod::Kafka(_) => {
                if let Some(kafka) = self.kafka.as_mut() {
                    kafka.publish(&log.name, &msg.to_string(), clock.secs());
                }
            }
        }
    }

    /// Close and reopen every per-peer log file in place, preserving
    /// filenames. Invoked on the reload signal so rotated files can be
    /// moved away without restarting the collector.
    pub fn reload(&mut self, peers: &mut PeerTable) {
        if !matches!(self.method, OutputMethod::File(_)) {
            return;
        }
        for (_, peer) in peers.iter_occupied_mut() {
            let log = match peer.log.as_mut() {
                Some(log) if log.file.is_some() => log,
                _ => continue,
            };
            log.file = None;
            match file::open_append(&log.name) {
                Ok(f) => log.file = Some(LineWriter::new(f)),
                Err(e) => warn!("[{}] unable to reopen {}: {}", peer.addr_str, log.name, e),
            }
        }
    }

    /// Reconnect any broker whose recorded failure has aged past its
    /// retry interval.
    pub fn retry_brokers(&mut self, now: i64) {
        if let Some(amqp) = self.amqp.as_mut() {
            if amqp.timers.ready_to_retry(now) {
                amqp.connect(now);
            }
        }
        if let Some(kafka) = self.kafka.as_mut() {
            if kafka.timers.ready_to_retry(now) {
                kafka.connect(now);
            }
        }
    }

    pub fn close(&mut self) {
        if let Some(amqp) = self.amqp.as_mut() {
            amqp.close(false);
        }
        if let Some(kafka) = self.kafka.as_mut() {
            kafka.close(false);
        }
    }
}
