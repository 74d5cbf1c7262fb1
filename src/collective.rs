//! Collective communication between the units of a job.
//!
//! A [`Transport`] moves opaque byte frames between ranks. [`Collective`] is
//! implemented for every transport and builds the three operations the
//! pipeline needs on top of point-to-point messages, all rooted at
//! [`AGGREGATOR_RANK`]:
//!
//! - `broadcast`: root sends one message to every rank
//! - `gather`: every rank sends one message, root receives them in rank order
//! - `barrier`: gather of `()` followed by a broadcast of `()`
//!
//! Messages are JSON-encoded with `serde_json` (`float_roundtrip` enabled, so
//! `f64` values arrive bit-identical).
//!
//! Two transports ship with the crate: [`LocalComm`] (in-process channel mesh,
//! one thread per unit) and [`TcpComm`] (star over TCP, one process per unit).
//! A unit that fails drops its endpoints; its peers observe a disconnect on
//! their next operation and fail too.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::mpsc::{Receiver, Sender, channel};

use log::{debug, trace, warn};
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

/// Root of every collective operation.
pub const AGGREGATOR_RANK: usize = 0;

#[derive(Debug, Error)]
pub enum CollectiveError {
    #[error("rank {0} disconnected")]
    Disconnected(usize),
    #[error("rank {rank} is not part of a group of {size}")]
    InvalidRank { rank: usize, size: usize },
    #[error("codec error: {0}")]
    Codec(String),
    #[error("IO error: {0}")]
    Io(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("unit {0} panicked")]
    Panicked(usize),
}

pub type CollectiveResult<T> = Result<T, CollectiveError>;

/// Point-to-point byte transport between the ranks of a fixed-size group.
pub trait Transport: Send {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;
    fn send(&mut self, dest: usize, payload: Vec<u8>) -> CollectiveResult<()>;
    fn recv(&mut self, src: usize) -> CollectiveResult<Vec<u8>>;
}

fn encode<M: Serialize>(msg: &M) -> CollectiveResult<Vec<u8>> {
    serde_json::to_vec(msg).map_err(|e| CollectiveError::Codec(e.to_string()))
}

fn decode<M: DeserializeOwned>(bytes: &[u8]) -> CollectiveResult<M> {
    serde_json::from_slice(bytes).map_err(|e| CollectiveError::Codec(e.to_string()))
}

pub trait Collective: Transport {
    /// Root passes `Some(msg)` and gets it back; every other rank passes
    /// `None` and receives the root's message.
    fn broadcast<M>(&mut self, msg: Option<M>) -> CollectiveResult<M>
    where
        M: Serialize + DeserializeOwned,
    {
        if self.rank() == AGGREGATOR_RANK {
            let msg = msg.ok_or_else(|| {
                CollectiveError::Protocol("broadcast root has no message".to_string())
            })?;
            let bytes = encode(&msg)?;
            trace!("broadcast {} bytes to {} ranks", bytes.len(), self.size() - 1);
            for dest in 1..self.size() {
                self.send(dest, bytes.clone())?;
            }
            Ok(msg)
        } else {
            decode(&self.recv(AGGREGATOR_RANK)?)
        }
    }

    /// Root receives every rank's message (its own first), in rank order.
    fn gather<M>(&mut self, msg: M) -> CollectiveResult<Option<Vec<M>>>
    where
        M: Serialize + DeserializeOwned,
    {
        if self.rank() == AGGREGATOR_RANK {
            let mut all = Vec::with_capacity(self.size());
            all.push(msg);
            for src in 1..self.size() {
                all.push(decode(&self.recv(src)?)?);
            }
            Ok(Some(all))
        } else {
            let bytes = encode(&msg)?;
            self.send(AGGREGATOR_RANK, bytes)?;
            Ok(None)
        }
    }

    fn barrier(&mut self) -> CollectiveResult<()> {
        self.gather(())?;
        let root = if self.rank() == AGGREGATOR_RANK {
            Some(())
        } else {
            None
        };
        self.broadcast(root)
    }
}

impl<T: Transport> Collective for T {}

// ============================================================================
// In-process transport
// ============================================================================

/// One rank's endpoints in an in-process channel mesh.
pub struct LocalComm {
    rank: usize,
    size: usize,
    senders: Vec<Option<Sender<Vec<u8>>>>,
    receivers: Vec<Option<Receiver<Vec<u8>>>>,
}

/// Fully connected in-process group: one channel per ordered pair of ranks.
pub struct LocalGroup {
    comms: Vec<LocalComm>,
}

impl LocalGroup {
    pub fn new(size: usize) -> Self {
        let mut comms: Vec<LocalComm> = (0..size)
            .map(|rank| LocalComm {
                rank,
                size,
                senders: (0..size).map(|_| None).collect(),
                receivers: (0..size).map(|_| None).collect(),
            })
            .collect();

        for src in 0..size {
            for dest in 0..size {
                if src == dest {
                    continue;
                }
                let (tx, rx) = channel();
                comms[src].senders[dest] = Some(tx);
                comms[dest].receivers[src] = Some(rx);
            }
        }
        debug!("LocalGroup: {} ranks", size);
        Self { comms }
    }

    pub fn size(&self) -> usize {
        self.comms.len()
    }

    pub fn into_comms(self) -> Vec<LocalComm> {
        self.comms
    }
}

impl Transport for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn send(&mut self, dest: usize, payload: Vec<u8>) -> CollectiveResult<()> {
        let tx = self
            .senders
            .get(dest)
            .and_then(|s| s.as_ref())
            .ok_or(CollectiveError::InvalidRank {
                rank: dest,
                size: self.size,
            })?;
        tx.send(payload)
            .map_err(|_| CollectiveError::Disconnected(dest))
    }

    fn recv(&mut self, src: usize) -> CollectiveResult<Vec<u8>> {
        let rx = self
            .receivers
            .get(src)
            .and_then(|r| r.as_ref())
            .ok_or(CollectiveError::InvalidRank {
                rank: src,
                size: self.size,
            })?;
        rx.recv().map_err(|_| CollectiveError::Disconnected(src))
    }
}

/// Run `f` once per rank of a fresh [`LocalGroup`], each on its own thread,
/// and return the results in rank order. A panicking unit yields
/// [`CollectiveError::Panicked`] in its slot.
pub fn launch_local<F, R>(size: usize, f: F) -> Vec<CollectiveResult<R>>
where
    F: Fn(LocalComm) -> R + Sync,
    R: Send,
{
    let comms = LocalGroup::new(size).into_comms();
    std::thread::scope(|scope| {
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                let f = &f;
                scope.spawn(move || f(comm))
            })
            .collect();
        handles
            .into_iter()
            .enumerate()
            .map(|(rank, h)| h.join().map_err(|_| CollectiveError::Panicked(rank)))
            .collect()
    })
}

// ============================================================================
// TCP transport
// ============================================================================

/// Star-shaped TCP group: rank 0 holds one stream per peer, every other rank
/// holds a single stream to rank 0. Frames are a little-endian `u64` length
/// followed by the payload.
pub struct TcpComm {
    rank: usize,
    size: usize,
    peers: Vec<Option<TcpStream>>,
}

fn io_err(e: std::io::Error) -> CollectiveError {
    CollectiveError::Io(e.to_string())
}

fn write_frame(mut stream: &TcpStream, payload: &[u8]) -> std::io::Result<()> {
    stream.write_all(&(payload.len() as u64).to_le_bytes())?;
    stream.write_all(payload)?;
    stream.flush()
}

/// Frames above this length are refused before any allocation.
pub const MAX_FRAME_LEN: u64 = 1 << 32;

/// Read one frame. A closed or broken stream is `Ok(None)`.
fn read_frame(mut stream: &TcpStream) -> CollectiveResult<Option<Vec<u8>>> {
    let mut len = [0u8; 8];
    if let Err(e) = stream.read_exact(&mut len) {
        warn!("frame header read failed: {}", e);
        return Ok(None);
    }
    let len = u64::from_le_bytes(len);
    if len > MAX_FRAME_LEN {
        return Err(CollectiveError::Protocol(format!(
            "frame of {} bytes exceeds the limit of {}",
            len, MAX_FRAME_LEN
        )));
    }
    let mut payload = vec![0u8; len as usize];
    if let Err(e) = stream.read_exact(&mut payload) {
        warn!("frame body read failed: {}", e);
        return Ok(None);
    }
    Ok(Some(payload))
}

impl TcpComm {
    /// Accept `size - 1` peers on `listener`. Each peer opens with a
    /// handshake frame carrying its `(rank, size)`.
    pub fn root(listener: TcpListener, size: usize) -> CollectiveResult<Self> {
        let mut peers: Vec<Option<TcpStream>> = (0..size).map(|_| None).collect();
        let mut connected = 1;
        while connected < size {
            let (stream, addr) = listener.accept().map_err(io_err)?;
            stream.set_nodelay(true).map_err(io_err)?;
            let handshake = read_frame(&stream)?.ok_or_else(|| {
                CollectiveError::Protocol(format!("peer {} closed before its handshake", addr))
            })?;
            let (rank, peer_size): (usize, usize) = decode(&handshake)?;
            if peer_size != size {
                return Err(CollectiveError::Protocol(format!(
                    "peer {} expects a group of {}, root has {}",
                    addr, peer_size, size
                )));
            }
            if rank == AGGREGATOR_RANK || rank >= size {
                return Err(CollectiveError::InvalidRank { rank, size });
            }
            if peers[rank].is_some() {
                return Err(CollectiveError::Protocol(format!(
                    "rank {} connected twice",
                    rank
                )));
            }
            debug!("TcpComm root: rank {} connected from {}", rank, addr);
            peers[rank] = Some(stream);
            connected += 1;
        }
        Ok(Self {
            rank: AGGREGATOR_RANK,
            size,
            peers,
        })
    }

    /// Connect rank `rank` of a `size`-rank group to the root at `addr`.
    pub fn connect(addr: impl ToSocketAddrs, rank: usize, size: usize) -> CollectiveResult<Self> {
        if rank == AGGREGATOR_RANK || rank >= size {
            return Err(CollectiveError::InvalidRank { rank, size });
        }
        let stream = TcpStream::connect(addr).map_err(io_err)?;
        stream.set_nodelay(true).map_err(io_err)?;
        write_frame(&stream, &encode(&(rank, size))?).map_err(io_err)?;

        let mut peers: Vec<Option<TcpStream>> = (0..size).map(|_| None).collect();
        peers[AGGREGATOR_RANK] = Some(stream);
        Ok(Self { rank, size, peers })
    }

    fn stream(&self, peer: usize) -> CollectiveResult<&TcpStream> {
        if peer >= self.size {
            return Err(CollectiveError::InvalidRank {
                rank: peer,
                size: self.size,
            });
        }
        self.peers[peer].as_ref().ok_or_else(|| {
            CollectiveError::Protocol(format!(
                "rank {} has no link to rank {}",
                self.rank, peer
            ))
        })
    }
}

impl Transport for TcpComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn send(&mut self, dest: usize, payload: Vec<u8>) -> CollectiveResult<()> {
        let stream = self.stream(dest)?;
        write_frame(stream, &payload).map_err(|e| {
            warn!("send to rank {} failed: {}", dest, e);
            CollectiveError::Disconnected(dest)
        })
    }

    fn recv(&mut self, src: usize) -> CollectiveResult<Vec<u8>> {
        let stream = self.stream(src)?;
        read_frame(stream)?.ok_or(CollectiveError::Disconnected(src))
    }
}
