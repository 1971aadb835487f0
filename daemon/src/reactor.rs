//! The collector's event loop: single-threaded readiness multiplexing
//! over the listener and every occupied peer slot, with round-robin read
//! dispatch, a deadline-bounded wait for the dump scheduler, and broker
//! retry timers polled once per iteration.

use std::collections::HashSet;
use std::io::{self, Read};
use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::RawFd;
use std::sync::Arc;

use crossbeam_channel as chan;
use log::*;

use telemd_common::config::Config;
use telemd_common::time::{Clock, DumpTimer, WAIT_TIMEOUT};

use crate::acl::AllowList;
use crate::decoder::Decoder;
use crate::dump::{self, DumpConfig, DumpScheduler};
use crate::error::Error;
use crate::listener;
use crate::msglog::{LogSeq, MsgLog};
use crate::peer::{Peer, PeerTable};

#[derive(Debug, PartialEq, Eq, Clone)]
enum Source {
    Listener,
    Peer(RawFd),
    Waker,
}

/// Control handle to a running daemon: wakes the reactor and delivers
/// reload or shutdown through single-slot channels, polled at fixed
/// points of the loop.
#[derive(Clone)]
pub struct Handle {
    reload: chan::Sender<()>,
    shutdown: chan::Sender<()>,
    waker: Arc<popol::Waker>,
}

impl Handle {
    /// Ask the reactor to close and reopen every per-peer log file.
    pub fn reload(&self) {
        self.reload.try_send(()).ok();
        self.waker.wake().ok();
    }

    /// Ask the reactor to stop after an orderly teardown.
    pub fn shutdown(&self) {
        self.shutdown.try_send(()).ok();
        self.waker.wake().ok();
    }
}

/// The telemetry collector daemon.
pub struct Daemon<D> {
    listener: TcpListener,
    local_addr: SocketAddr,
    /// Backup interest set; copied into the poll set on every wait.
    sources: popol::Sources<Source>,
    peers: PeerTable,
    allow: Option<AllowList>,
    clock: Clock,
    seq: LogSeq,
    msglog: Option<MsgLog>,
    dump: Option<DumpScheduler>,
    decoder: D,
    /// Round-robin read offset; see `PeerTable::select_ready`.
    rr: usize,
    reload: chan::Receiver<()>,
    shutdown: chan::Receiver<()>,
    handle: Handle,
}

impl<D: Decoder> Daemon<D> {
    /// Build the daemon from a validated configuration: bind the
    /// listener, load the allow list, connect the message-log backend and
    /// start the dump worker. Any failure here is fatal to the process.
    pub fn new(cfg: Config, decoder: D) -> Result<Self, Error> {
        cfg.validate()?;

        let max_peers = cfg.max_peers();
        info!("maximum telemetry peers allowed: {}", max_peers);

        let listener = listener::bind(&cfg)?;
        let local_addr = listener.local_addr()?;

        let allow = match cfg.allow_file() {
            Some(path) => {
                let allow = AllowList::load(path)?;
                info!("allow list {}: {} entries", path.display(), allow.len());
                Some(allow)
            }
            None => None,
        };

        let mut sources = popol::Sources::new();
        sources.register(Source::Listener, &listener, popol::interest::READ);

        let (reload_tx, reload) = chan::bounded(1);
        let (shutdown_tx, shutdown) = chan::bounded(1);
        let waker = Arc::new(popol::Waker::new(&mut sources, Source::Waker)?);
        let handle = Handle {
            reload: reload_tx,
            shutdown: shutdown_tx,
            waker,
        };

        let clock = Clock::new(cfg.timestamps_since_epoch);

        let msglog = cfg
            .msglog_method()?
            .map(|method| {
                MsgLog::new(
                    method,
                    cfg.msglog_output(),
                    cfg.msglog_amqp(),
                    cfg.msglog_kafka(),
                    clock.secs(),
                )
            });

        let dump = match cfg.dump_method()? {
            Some(method) => {
                let period = cfg.dump_refresh_time();
                if period == 0 {
                    warn!("invalid 'telemetry_dump_refresh_time', periodic dumps disabled");
                    None
                } else {
                    let timer = DumpTimer::new(clock.secs(), period as i64);
                    let dump_cfg = DumpConfig {
                        method,
                        output: cfg.dump_output(),
                        latest_file: cfg.dump_latest_file(),
                        amqp: cfg.dump_amqp(),
                        kafka: cfg.dump_kafka(),
                    };
                    Some(DumpScheduler::start(dump_cfg, timer, period)?)
                }
            }
            None => None,
        };

        info!("waiting for telemetry data on {}", local_addr);

        Ok(Self {
            listener,
            local_addr,
            sources,
            peers: PeerTable::new(max_peers),
            allow,
            clock,
            seq: LogSeq::default(),
            msglog,
            dump,
            decoder,
            rr: 0,
            reload,
            shutdown,
            handle,
        })
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Drive the collector until a shutdown is delivered.
    pub fn run(&mut self) -> Result<(), Error> {
        let mut events = popol::Events::new();
        let mut ready: HashSet<RawFd> = HashSet::new();
        let mut invalid: Vec<RawFd> = Vec::new();

        loop {
            // A slot transitioned since the last turn: recompute the
            // table bounds before anything selects on them.
            if self.peers.is_dirty() {
                self.peers.recount();
            }

            let timeout = match &self.dump {
                Some(dump) => dump.timer.timeout(self.clock.secs()),
                None => WAIT_TIMEOUT,
            };

            ready.clear();
            invalid.clear();
            let mut listener_ready = false;
            let mut timed_out = false;

            match self.sources.wait_timeout(&mut events, timeout) {
                Ok(()) => {
                    for (source, ev) in events.iter() {
                        match source {
                            Source::Listener => {
                                if ev.readable {
                                    listener_ready = true;
                                }
                            }
                            Source::Peer(fd) => {
                                if ev.invalid {
                                    invalid.push(*fd);
                                } else if ev.readable || ev.errored || ev.hangup {
                                    // Errors surface on the next read.
                                    ready.insert(*fd);
                                }
                            }
                            Source::Waker => {
                                popol::Waker::reset(ev.source).ok();
                            }
                        }
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::TimedOut => {
                    timed_out = true;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }

            for fd in invalid.drain(..) {
                self.drop_invalid(fd);
            }

            if self.shutdown.try_recv().is_ok() {
                self.teardown();
                return Ok(());
            }

            // Reload: close and reopen every per-peer log file in place.
            if self.reload.try_recv().is_ok() {
                if let Some(msglog) = &mut self.msglog {
                    debug!("reopening telemetry peer log files");
                    msglog.reload(&mut self.peers);
                }
            }

            // Routine timers: fire one dump per crossed deadline and poll
            // the broker reconnect governors.
            if self.msglog.is_some() || self.dump.is_some() {
                self.clock.refresh();

                if let Some(dump) = &mut self.dump {
                    while dump.timer.due(self.clock.secs()) {
                        let job =
                            dump::collect_job(&mut self.peers, self.seq, &self.clock, dump.period());
                        dump.fire(job);
                        dump.timer.advance();
                    }
                }

                if let Some(msglog) = &mut self.msglog {
                    msglog.retry_brokers(self.clock.secs());
                }
            }

            // Woken by the timeout alone: routine checks are done.
            if timed_out {
                continue;
            }

            // One accept per turn; an accept and one read may share it.
            if listener_ready {
                self.accept_peer();
            }

            self.read_phase(&ready);
        }
    }

    /// Accept path: ACL gate, first-free-slot install, per-peer log and
    /// dump scratch initialization. Surplus or rejected connections are
    /// briefly accepted, then closed on the spot.
    fn accept_peer(&mut self) {
        let (stream, addr) = match self.listener.accept() {
            Ok(pair) => pair,
            Err(e) => {
                // Non-fatal; proceed to the read phase.
                debug!("accept error: {}", e);
                return;
            }
        };
        let addr = listener::normalize_addr(addr);

        // An empty allow list gates nothing; the default is allow-all.
        if let Some(allow) = &self.allow {
            if !allow.is_empty() && !allow.contains(addr.ip()) {
                info!("[{}] connection refused by allow list", addr.ip());
                return;
            }
        }

        self.clock.refresh();
        let mut peer = Peer::new(stream, addr, self.clock.secs());
        if let Some(msglog) = &mut self.msglog {
            msglog.init_peer(&mut peer, &self.clock);
        }
        if self.dump.is_some() {
            peer.dump = Some(Vec::new());
        }
        let fd = peer.fd();

        match self.peers.insert(peer) {
            Some(idx) => {
                if let Some(peer) = self.peers.get(idx) {
                    self.sources
                        .register(Source::Peer(fd), &peer.stream, popol::interest::READ);
                    info!(
                        "[{}] telemetry peers usage: {}/{}",
                        peer.addr_str,
                        self.peers.peers_num(),
                        self.peers.capacity()
                    );
                }
            }
            None => {
                // The connection was dropped with the rejected peer value.
                error!(
                    "insufficient number of telemetry peers configured by \
                     'telemetry_max_peers' ({})",
                    self.peers.capacity()
                );
            }
        }
    }

    /// Read phase: service at most one ready peer per turn, picked
    /// round-robin so no peer starves behind a lower-indexed one.
    fn read_phase(&mut self, ready: &HashSet<RawFd>) {
        let idx = match self.peers.select_ready(self.rr, |p| ready.contains(&p.fd())) {
            Some(idx) => idx,
            None => return,
        };
        self.rr = (self.rr + 1) % self.peers.max_idx();
        self.read_peer(idx);
    }

    fn read_peer(&mut self, idx: usize) {
        let peer = match self.peers.get_mut(idx) {
            Some(peer) => peer,
            None => return,
        };

        let trunc = peer.buf.truncated_len;
        match peer.stream.read(&mut peer.buf.base[trunc..]) {
            Ok(n) if n > 0 => {
                let msglen = n + trunc;
                let decoded = self
                    .decoder
                    .decode(&peer.addr_str, &peer.buf.base[..msglen]);

                // Slide the incomplete tail back to the buffer head.
                let new_trunc = decoded.truncated_len.min(msglen);
                if new_trunc > 0 {
                    peer.buf.base.copy_within(msglen - new_trunc..msglen, 0);
                }
                peer.buf.truncated_len = new_trunc;

                for record in decoded.records {
                    if let Some(scratch) = peer.dump.as_mut() {
                        scratch.push(record.clone());
                    }
                    if let Some(msglog) = &mut self.msglog {
                        msglog.log(&mut self.seq, peer, record, &self.clock);
                    }
                }
            }
            ret => {
                // Zero-length read or error: the peer is gone.
                match ret {
                    Err(e) => info!("[{}] connection reset by peer ({})", peer.addr_str, e),
                    _ => info!("[{}] connection reset by peer", peer.addr_str),
                }
                let fd = peer.fd();
                self.sources.unregister(&Source::Peer(fd));
                self.peers.remove(idx);
            }
        }
    }

    /// A descriptor the poller flagged as invalid: it was closed behind
    /// our back. Unregister it and free the slot it occupied.
    fn drop_invalid(&mut self, fd: RawFd) {
        error!("socket fd {} is invalid, removing", fd);
        self.sources.unregister(&Source::Peer(fd));
        let idx = self
            .peers
            .iter_occupied()
            .find(|(_, peer)| peer.fd() == fd)
            .map(|(idx, _)| idx);
        if let Some(idx) = idx {
            self.peers.remove(idx);
        }
    }

    fn teardown(&mut self) {
        for idx in 0..self.peers.capacity() {
            if let Some(peer) = self.peers.remove(idx) {
                self.sources.unregister(&Source::Peer(peer.fd()));
            }
        }
        if let Some(msglog) = &mut self.msglog {
            msglog.close();
        }
        if let Some(dump) = self.dump.take() {
            dump.shutdown();
        }
        info!("telemetry daemon shut down");
    }
}
