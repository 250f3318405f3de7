//! Replay streams of time-batched rollout data.
//!
//! A [`Tape`] is written once and read many times. Each call to
//! [`Tape::read_tape`] starts its own background producer which feeds a
//! bounded queue; the returned [`TapeReader`] consumes that queue lazily.
//! There is no shared cursor, so independent readers never interfere and
//! every read reproduces the same batches in the same order.

use crate::error::{NpgError, Result};
use crate::types::Tensor;
use crossbeam_channel::{bounded, Receiver, Sender};
use log::trace;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Default number of batches buffered between a producer and its reader.
pub const DEFAULT_QUEUE_CAPACITY: usize = 4;

/// One timestep of data across a fixed-size batch of sequences.
///
/// `packed` holds one row per present sequence, in slot order. Absent slots
/// have no row at all.
#[derive(Debug, Clone, PartialEq)]
pub struct RolloutBatch {
    /// Values of the present sequences, one row each
    pub packed: Tensor,
    /// One flag per batch slot marking still-active sequences
    pub present: Vec<bool>,
}

impl RolloutBatch {
    /// Creates a batch, checking that rows match the presence mask.
    pub fn new(packed: Tensor, present: Vec<bool>) -> Result<Self> {
        let num_present = present.iter().filter(|&&p| p).count();
        if packed.nrows() != num_present {
            return Err(NpgError::shape_mismatch(
                format!("{} packed rows", num_present),
                format!("{} rows", packed.nrows()),
            ));
        }
        Ok(Self { packed, present })
    }

    /// Creates a batch from a flat row-major slice.
    pub fn from_flat(values: &[f64], present: Vec<bool>) -> Result<Self> {
        let rows = present.iter().filter(|&&p| p).count();
        if rows == 0 {
            return if values.is_empty() {
                Self::new(Tensor::zeros(0, 0), present)
            } else {
                Err(NpgError::shape_mismatch("no values", values.len()))
            };
        }
        if values.len() % rows != 0 {
            return Err(NpgError::shape_mismatch(
                format!("a multiple of {} values", rows),
                values.len(),
            ));
        }
        let cols = values.len() / rows;
        Self::new(Tensor::from_row_slice(rows, cols, values), present)
    }

    /// Number of batch slots.
    pub fn batch_size(&self) -> usize {
        self.present.len()
    }

    /// Number of active sequences.
    pub fn num_present(&self) -> usize {
        self.packed.nrows()
    }
}

/// An append-once, read-many sequence of [`RolloutBatch`] records.
pub trait Tape: Send + Sync {
    /// Number of timesteps recorded.
    fn len(&self) -> usize;

    /// Whether no timesteps were recorded.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads timesteps `start..end` (to the end of the tape when `end` is
    /// `None`) through a fresh producer.
    fn read_tape(&self, start: usize, end: Option<usize>) -> Result<TapeReader>;

    /// Reads the whole tape.
    fn read_all(&self) -> Result<TapeReader> {
        self.read_tape(0, None)
    }
}

/// Resolves `start..end` against a tape of length `len`.
fn resolve_range(len: usize, start: usize, end: Option<usize>) -> Result<(usize, usize)> {
    let end = end.unwrap_or(len);
    if start > end || end > len {
        return Err(NpgError::stream_read(format!(
            "range {}..{} is invalid for a tape of length {}",
            start, end, len
        )));
    }
    Ok((start, end))
}

/// Pulls the batch for timestep `t` from a stream read in lockstep with
/// another one. A stream that ends early is a read failure.
pub fn next_batch<I>(reader: &mut I, t: usize) -> Result<RolloutBatch>
where
    I: Iterator<Item = Result<RolloutBatch>>,
{
    reader.next().unwrap_or_else(|| {
        Err(NpgError::stream_read(format!(
            "stream ended before timestep {}",
            t
        )))
    })
}

/// Consumer side of one tape traversal.
///
/// Yields batches in strictly increasing timestep order. The producer thread
/// stops on its own when the reader is dropped early.
pub struct TapeReader {
    receiver: Receiver<Result<RolloutBatch>>,
    producer: Option<JoinHandle<()>>,
}

impl TapeReader {
    /// Runs `produce` on a background thread feeding a queue of `capacity`.
    ///
    /// The producer receives a [`Sender`] and should stop as soon as a send
    /// fails, which signals that the reader is gone.
    pub fn spawn<F>(capacity: usize, produce: F) -> Self
    where
        F: FnOnce(Sender<Result<RolloutBatch>>) + Send + 'static,
    {
        let (sender, receiver) = bounded(capacity);
        let producer = thread::spawn(move || produce(sender));
        Self {
            receiver,
            producer: Some(producer),
        }
    }

    /// Collects every remaining batch, stopping at the first error.
    pub fn collect_batches(self) -> Result<Vec<RolloutBatch>> {
        self.collect()
    }
}

impl Iterator for TapeReader {
    type Item = Result<RolloutBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.receiver.recv() {
            Ok(item) => Some(item),
            Err(_) => {
                // Disconnected: the producer finished or died.
                let handle = self.producer.take()?;
                match handle.join() {
                    Ok(()) => None,
                    Err(_) => Some(Err(NpgError::stream_read("tape producer panicked"))),
                }
            }
        }
    }
}

impl fmt::Debug for TapeReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TapeReader")
            .field("buffered", &self.receiver.len())
            .field("running", &self.producer.is_some())
            .finish()
    }
}

/// Append-only builder for a [`ReferenceTape`].
#[derive(Debug)]
pub struct TapeWriter {
    batches: Vec<RolloutBatch>,
    capacity: usize,
}

impl TapeWriter {
    /// Creates an empty writer.
    pub fn new() -> Self {
        Self {
            batches: Vec::new(),
            capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    /// Sets the queue capacity of the finished tape's readers.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Appends the next timestep.
    ///
    /// Every batch on a tape must describe the same number of slots.
    pub fn write(&mut self, batch: RolloutBatch) -> Result<()> {
        if let Some(first) = self.batches.first() {
            if first.batch_size() != batch.batch_size() {
                return Err(NpgError::shape_mismatch(
                    format!("batch size {}", first.batch_size()),
                    format!("batch size {}", batch.batch_size()),
                ));
            }
        }
        self.batches.push(batch);
        Ok(())
    }

    /// Number of timesteps written so far.
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    /// Whether nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Seals the tape. No further writes are possible.
    pub fn finish(self) -> ReferenceTape {
        ReferenceTape {
            batches: Arc::new(self.batches),
            capacity: self.capacity,
        }
    }
}

impl Default for TapeWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// In-memory tape shared read-only between readers.
#[derive(Debug, Clone)]
pub struct ReferenceTape {
    batches: Arc<Vec<RolloutBatch>>,
    capacity: usize,
}

impl ReferenceTape {
    /// Builds a tape from complete batches.
    pub fn from_batches(batches: Vec<RolloutBatch>) -> Result<Self> {
        let mut writer = TapeWriter::new();
        for batch in batches {
            writer.write(batch)?;
        }
        Ok(writer.finish())
    }

    /// Queue capacity used by readers of this tape.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Direct access to a recorded timestep.
    pub fn get(&self, index: usize) -> Option<&RolloutBatch> {
        self.batches.get(index)
    }
}

impl Tape for ReferenceTape {
    fn len(&self) -> usize {
        self.batches.len()
    }

    fn read_tape(&self, start: usize, end: Option<usize>) -> Result<TapeReader> {
        let (start, end) = resolve_range(self.batches.len(), start, end)?;
        let batches = Arc::clone(&self.batches);
        Ok(TapeReader::spawn(self.capacity, move |sender| {
            trace!("reference tape producer reading {}..{}", start, end);
            for batch in &batches[start..end] {
                if sender.send(Ok(batch.clone())).is_err() {
                    trace!("reference tape reader dropped early");
                    return;
                }
            }
        }))
    }
}

/// Tape that recomputes each timestep on demand.
///
/// The generator is called once per index and per read; it must return the
/// same batch for the same index every time.
pub struct GeneratorTape<F> {
    len: usize,
    generator: Arc<F>,
    capacity: usize,
}

impl<F> GeneratorTape<F>
where
    F: Fn(usize) -> Result<RolloutBatch> + Send + Sync + 'static,
{
    /// Creates a tape of `len` timesteps backed by `generator`.
    pub fn new(len: usize, generator: F) -> Self {
        Self {
            len,
            generator: Arc::new(generator),
            capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    /// Sets the queue capacity.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
}

impl<F> Tape for GeneratorTape<F>
where
    F: Fn(usize) -> Result<RolloutBatch> + Send + Sync + 'static,
{
    fn len(&self) -> usize {
        self.len
    }

    fn read_tape(&self, start: usize, end: Option<usize>) -> Result<TapeReader> {
        let (start, end) = resolve_range(self.len, start, end)?;
        let generator = Arc::clone(&self.generator);
        Ok(TapeReader::spawn(self.capacity, move |sender| {
            for index in start..end {
                let item = (*generator)(index);
                let failed = item.is_err();
                if sender.send(item).is_err() || failed {
                    return;
                }
            }
        }))
    }
}

impl<F> fmt::Debug for GeneratorTape<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratorTape")
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .finish()
    }
}
