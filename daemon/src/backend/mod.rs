//! Output backends: text file, AMQP broker, Kafka broker. One backend is
//! active per output channel; brokers share the init/connect/publish/close
//! contract and the last-failure/retry-interval reconnect governor.

pub mod amqp;
pub mod file;
pub mod kafka;

use chrono::{DateTime, Local};
use log::*;

/// Broker reconnect governor: a last-failure stamp and a retry interval.
/// A reconnect is attempted once the recorded failure is at least one
/// retry interval old.
#[derive(Debug, Clone, Copy)]
pub struct BrokerTimers {
    last_fail: i64,
    retry_interval: u64,
}

impl BrokerTimers {
    pub fn new(retry_interval: u64) -> Self {
        Self {
            last_fail: 0,
            retry_interval,
        }
    }

    pub fn last_fail(&self) -> i64 {
        self.last_fail
    }

    pub fn set_last_fail(&mut self, now: i64) {
        self.last_fail = now;
    }

    pub fn unset_last_fail(&mut self) {
        self.last_fail = 0;
    }

    pub fn retry_interval(&self) -> u64 {
        self.retry_interval
    }

    pub fn ready_to_retry(&self, now: i64) -> bool {
        self.last_fail != 0 && self.last_fail + self.retry_interval as i64 <= now
    }
}

/// Render an output name template for a peer. `$peer_src_ip` is the only
/// recognized peer variable; the result then goes through strftime-style
/// substitution against the given timestamp.
pub fn render_name(template: &str, peer_ip: &str, when: DateTime<Local>) -> String {
    let name = template
        .replace("${peer_src_ip}", peer_ip)
        .replace("$peer_src_ip", peer_ip);
    render_strftime(&name, when)
}

fn render_strftime(name: &str, when: DateTime<Local>) -> String {
    use chrono::format::{Item, StrftimeItems};

    let items: Vec<Item> = StrftimeItems::new(name).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        warn!("malformed strftime pattern in '{}', kept literal", name);
        name.to_owned()
    } else {
        when.format_with_items(items.into_iter()).to_string()
    }
}
