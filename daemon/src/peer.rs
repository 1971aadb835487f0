//! Fixed-capacity peer table.
//!
//! One slot per connected device. Slots are allocated first-free on
//! accept, freed on peer close, and never moved; derived bounds are
//! recomputed lazily, only after a slot transitions between free and
//! occupied.

use std::net::{IpAddr, SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};

use serde_json::Value;

use crate::msglog::PeerLog;

/// Receive buffer size per peer.
pub const PEER_BUF_SIZE: usize = 32 * 1024;

/// Receive buffer with carry-over for a partial trailing record.
///
/// Reads always land in `base[truncated_len..]`; after a decode pass the
/// incomplete tail is slid back to the front and `truncated_len` updated.
pub struct PeerBuf {
    pub base: Box<[u8]>,
    pub truncated_len: usize,
}

impl PeerBuf {
    fn new() -> Self {
        Self {
            base: vec![0; PEER_BUF_SIZE].into_boxed_slice(),
            truncated_len: 0,
        }
    }
}

/// One connected telemetry peer.
pub struct Peer {
    pub stream: TcpStream,
    pub addr: IpAddr,
    pub port: u16,
    pub addr_str: String,
    pub buf: PeerBuf,
    /// Message-log destination, when that channel is enabled.
    pub log: Option<PeerLog>,
    /// Snapshot scratch filled by the decoder between dump events; opaque
    /// to the reactor, handed to the dump worker by value.
    pub dump: Option<Vec<Value>>,
    /// First-connection timestamp, seconds since the epoch.
    pub since: i64,
}

impl Peer {
    pub fn new(stream: TcpStream, addr: SocketAddr, since: i64) -> Self {
        let ip = addr.ip();
        Self {
            addr_str: ip.to_string(),
            addr: ip,
            port: addr.port(),
            buf: PeerBuf::new(),
            log: None,
            dump: None,
            since,
            stream,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

/// The peer table. Capacity is fixed at construction.
pub struct PeerTable {
    slots: Vec<Option<Peer>>,
    /// Set on any free/occupied transition; cleared by `recount`.
    dirty: bool,
    peers_num: usize,
    /// Highest occupied index + 1; bounds round-robin scans.
    max_idx: usize,
}

impl PeerTable {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            dirty: false,
            peers_num: 0,
            max_idx: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn peers_num(&self) -> usize {
        self.peers_num
    }

    pub fn max_idx(&self) -> usize {
        self.max_idx
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Install a peer in the first free slot. The connection is dropped
    /// on the spot when the table is full.
    pub fn insert(&mut self, peer: Peer) -> Option<usize> {
        let idx = self.slots.iter().position(|slot| slot.is_none())?;
        self.slots[idx] = Some(peer);
        self.peers_num += 1;
        self.dirty = true;
        Some(idx)
    }

    /// Free a slot, returning its peer.
    pub fn remove(&mut self, idx: usize) -> Option<Peer> {
        let peer = self.slots.get_mut(idx)?.take()?;
        self.peers_num = self.peers_num.saturating_sub(1);
        self.dirty = true;
        Some(peer)
    }

    pub fn get(&self, idx: usize) -> Option<&Peer> {
        self.slots.get(idx)?.as_ref()
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Peer> {
        self.slots.get_mut(idx)?.as_mut()
    }

    /// Recompute the derived bounds and clear the dirty flag.
    pub fn recount(&mut self) {
        self.peers_num = 0;
        self.max_idx = 0;
        for (idx, slot) in self.slots.iter().enumerate() {
            if slot.is_some() {
                self.peers_num += 1;
                self.max_idx = idx + 1;
            }
        }
        self.dirty = false;
    }

    /// Pick the first occupied, ready slot starting from the round-robin
    /// offset `rr`, scanning modulo `max_idx`. The offset keeps a slow
    /// low-indexed peer from perpetually preempting later ones.
    pub fn select_ready<F>(&self, rr: usize, ready: F) -> Option<usize>
    where
        F: Fn(&Peer) -> bool,
    {
        let bound = self.max_idx;
        for i in 0..bound {
            let loc = (i + rr) % bound;
            if let Some(peer) = self.slots[loc].as_ref() {
                if ready(peer) {
                    return Some(loc);
                }
            }
        }
        None
    }

    pub fn iter_occupied(&self) -> impl Iterator<Item = (usize, &Peer)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|peer| (idx, peer)))
    }

    pub fn iter_occupied_mut(&mut self) -> impl Iterator<Item = (usize, &mut Peer)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_mut().map(|peer| (idx, peer)))
    }
}
