//! Kafka producer behind the unified backend contract.

use std::time::Duration;

use log::*;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{BaseProducer, BaseRecord, Producer};

use telemd_common::config::KafkaParams;

use super::BrokerTimers;

/// A Kafka broker endpoint for one output channel.
pub struct KafkaHost {
    params: KafkaParams,
    producer: Option<BaseProducer>,
    pub timers: BrokerTimers,
}

impl KafkaHost {
    pub fn init(params: KafkaParams) -> Self {
        let timers = BrokerTimers::new(params.retry);
        Self {
            params,
            producer: None,
            timers,
        }
    }

    /// Create the producer; librdkafka maintains the broker connection
    /// from here on, so later failures surface on publish.
    pub fn connect(&mut self, now: i64) -> bool {
        let brokers = format!("{}:{}", self.params.broker_host, self.params.broker_port);
        match ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", "5000")
            .create::<BaseProducer>()
        {
            Ok(producer) => {
                self.producer = Some(producer);
                self.timers.unset_last_fail();
                info!("producing to Kafka at {}", brokers);
                true
            }
            Err(e) => {
                warn!("unable to create Kafka producer for {}: {}", brokers, e);
                self.producer = None;
                self.timers.set_last_fail(now);
                false
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.producer.is_some()
    }

    /// Enqueue one record; delivery is handled by the client library.
    pub fn publish(&mut self, topic: &str, payload: &str, now: i64) -> bool {
        let producer = match self.producer.as_ref() {
            Some(producer) => producer,
            None => return false,
        };

        let mut record = BaseRecord::<(), str>::to(topic).payload(payload);
        if let Some(partition) = self.params.partition {
            record = record.partition(partition);
        }

        let sent = match producer.send(record) {
            Ok(()) => true,
            Err((e, _)) => {
                warn!("produce to Kafka topic {} failed: {}", topic, e);
                self.timers.set_last_fail(now);
                false
            }
        };
        // Drive delivery callbacks without blocking the caller.
        let _ = producer.poll(Duration::from_millis(0));
        sent
    }

    /// Tear the producer down; a non-forced close drains the queue first.
    pub fn close(&mut self, force: bool) {
        if let Some(producer) = self.producer.take() {
            if !force {
                let _ = producer.flush(Duration::from_secs(1));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> KafkaParams {
        KafkaParams {
            broker_host: "127.0.0.1".into(),
            broker_port: 9092,
            partition: Some(0),
            retry: 60,
        }
    }

    #[test]
    fn publish_without_producer_is_a_no_op() {
        let mut host = KafkaHost::init(params());
        assert!(!host.is_connected());
        assert!(!host.publish("telemetry", "{}", 1000));
        assert_eq!(host.timers.last_fail(), 0);
    }

    #[test]
    fn retry_interval_comes_from_the_channel_params() {
        let host = KafkaHost::init(params());
        assert_eq!(host.timers.retry_interval(), 60);
    }
}
