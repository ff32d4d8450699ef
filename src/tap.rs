//! Log taps.
//!
//! A tap is a passive observer on a node subtree or a single port. It
//! records one named channel (`info`, `debug` or `trace`) into a sink.
//! Attaching or detaching a tap never changes simulated behaviour.
//!
//! ```
//! use archsim::tap::{TapChannel, TapSink};
//!
//! let channel: TapChannel = "debug".parse().unwrap();
//! assert_eq!(channel, TapChannel::Debug);
//!
//! let (sink, buffer) = TapSink::memory();
//! # drop(sink);
//! assert!(buffer.lock().is_empty());
//! ```

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{KernelError, KernelResult};
use crate::tree::Tree;
use crate::types::{NodeId, PortId, TapId, Tick};

/// Shared in-memory line buffer.
pub type SharedBuffer = Arc<Mutex<Vec<String>>>;

/// A named log channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TapChannel {
    Info,
    Debug,
    Trace,
}

impl TapChannel {
    pub fn name(&self) -> &'static str {
        match self {
            TapChannel::Info => "info",
            TapChannel::Debug => "debug",
            TapChannel::Trace => "trace",
        }
    }
}

impl fmt::Display for TapChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TapChannel {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(TapChannel::Info),
            "debug" => Ok(TapChannel::Debug),
            "trace" => Ok(TapChannel::Trace),
            other => Err(KernelError::Tap(format!(
                "unknown channel '{}' (expected info, debug or trace)",
                other
            ))),
        }
    }
}

/// Where a tap writes.
pub enum TapSink {
    Writer(Box<dyn Write + Send>),
    /// Created (truncated) when the tap is attached.
    File(PathBuf),
    Memory(SharedBuffer),
}

impl TapSink {
    /// A fresh in-memory sink and a handle to read it back.
    pub fn memory() -> (Self, SharedBuffer) {
        let buf = SharedBuffer::default();
        (TapSink::Memory(buf.clone()), buf)
    }

    pub fn stdout() -> Self {
        TapSink::Writer(Box::new(std::io::stdout()))
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        TapSink::File(path.into())
    }
}

impl fmt::Debug for TapSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TapSink::Writer(_) => f.write_str("Writer(..)"),
            TapSink::File(p) => f.debug_tuple("File").field(p).finish(),
            TapSink::Memory(b) => f.debug_tuple("Memory").field(&b.lock().len()).finish(),
        }
    }
}

enum Output {
    Writer(Box<dyn Write + Send>),
    File(BufWriter<File>),
    Memory(SharedBuffer),
}

impl Output {
    fn open(sink: TapSink) -> KernelResult<Self> {
        Ok(match sink {
            TapSink::Writer(w) => Output::Writer(w),
            TapSink::File(path) => {
                let file = File::create(&path).map_err(|e| {
                    KernelError::Tap(format!("cannot open '{}': {}", path.display(), e))
                })?;
                Output::File(BufWriter::new(file))
            }
            TapSink::Memory(buf) => Output::Memory(buf),
        })
    }

    fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        match self {
            Output::Writer(w) => writeln!(w, "{}", line),
            Output::File(w) => writeln!(w, "{}", line),
            Output::Memory(buf) => {
                buf.lock().push(line.to_string());
                Ok(())
            }
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Output::Writer(w) => w.flush(),
            Output::File(w) => w.flush(),
            Output::Memory(_) => Ok(()),
        }
    }
}

/// What a tap observes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TapTarget {
    /// A node and everything beneath it.
    Node(NodeId),
    Port(PortId),
}

struct Tap {
    target: TapTarget,
    channel: TapChannel,
    output: Output,
    lines: u64,
}

/// A message offered to the taps.
#[derive(Clone, Copy, Debug)]
pub struct TapMessage<'a> {
    pub tick: Tick,
    pub node: NodeId,
    pub port: Option<PortId>,
    pub channel: TapChannel,
    /// Path of the emitting node or port.
    pub source: &'a str,
    pub text: &'a str,
}

/// Formats a line the way every sink records it.
pub fn format_line(tick: Tick, source: &str, channel: TapChannel, text: &str) -> String {
    format!("{{{:010} {} {}}} {}", tick, source, channel, text)
}

/// All taps of a simulation.
#[derive(Default)]
pub struct TapRegistry {
    taps: BTreeMap<TapId, Tap>,
    next_id: TapId,
}

impl TapRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, target: TapTarget, channel: TapChannel, sink: TapSink) -> KernelResult<TapId> {
        let output = Output::open(sink)?;
        let id = self.next_id;
        self.next_id += 1;
        self.taps.insert(
            id,
            Tap {
                target,
                channel,
                output,
                lines: 0,
            },
        );
        Ok(id)
    }

    /// Flushes and removes a tap. Returns the number of lines it recorded.
    pub fn detach(&mut self, id: TapId) -> KernelResult<u64> {
        let mut tap = self
            .taps
            .remove(&id)
            .ok_or_else(|| KernelError::Tap(format!("no tap with id {}", id)))?;
        tap.output
            .flush()
            .map_err(|e| KernelError::Tap(format!("flush failed: {}", e)))?;
        Ok(tap.lines)
    }

    /// Flushes and removes every tap.
    ///
    /// Every tap is removed even when a flush fails; the first flush error
    /// is returned after all of them are gone.
    pub fn detach_all(&mut self) -> KernelResult<usize> {
        let ids: Vec<TapId> = self.taps.keys().copied().collect();
        let mut first_err = None;
        for id in &ids {
            if let Err(e) = self.detach(*id) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(ids.len()),
        }
    }

    /// Removes taps whose target satisfies `pred`.
    pub(crate) fn detach_where<F>(&mut self, pred: F) -> KernelResult<usize>
    where
        F: Fn(&TapTarget) -> bool,
    {
        let ids: Vec<TapId> = self
            .taps
            .iter()
            .filter(|(_, t)| pred(&t.target))
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            self.detach(*id)?;
        }
        Ok(ids.len())
    }

    pub fn len(&self) -> usize {
        self.taps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.taps.is_empty()
    }

    /// True if any tap records `channel`.
    pub fn listening(&self, channel: TapChannel) -> bool {
        self.taps.values().any(|t| t.channel == channel)
    }

    /// Offers a message to every matching tap. Returns how many recorded it.
    pub fn emit(&mut self, tree: &Tree, msg: &TapMessage<'_>) -> KernelResult<usize> {
        let mut line: Option<String> = None;
        let mut hits = 0;
        for tap in self.taps.values_mut() {
            if tap.channel != msg.channel {
                continue;
            }
            let matches = match tap.target {
                TapTarget::Node(n) => tree.is_within(msg.node, n),
                TapTarget::Port(p) => msg.port == Some(p),
            };
            if !matches {
                continue;
            }
            let text = line.get_or_insert_with(|| format_line(msg.tick, msg.source, msg.channel, msg.text));
            tap.output
                .write_line(text)
                .map_err(|e| KernelError::Tap(format!("write failed: {}", e)))?;
            tap.lines += 1;
            hits += 1;
        }
        Ok(hits)
    }
}

impl fmt::Debug for TapRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TapRegistry").field("taps", &self.taps.len()).finish()
    }
}
