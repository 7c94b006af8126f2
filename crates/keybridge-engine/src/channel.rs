//! The event channel between the listener loop and the consumer thread.
//!
//! A bounded single-producer/single-consumer conduit of fixed 16-byte
//! records. Writes never block: when the channel is full or closed the record
//! is dropped and counted.
//!
//! Every record carries the drop count at the time it was written, so the
//! reader learns where in the stream records went missing. A loss is reported
//! as [`Received::Gap`] once every record written before it has been
//! delivered: either just ahead of the first record written after the loss,
//! or as soon as the channel runs empty.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bincode::config::{Configuration, Fixint, LittleEndian, NoLimit};
use keybridge_types::KeyEvent;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::trace;

use crate::error::ChannelError;

type Record = [u8; KeyEvent::RECORD_SIZE];

struct Frame {
    record: Record,
    /// Records dropped before this one was written.
    dropped_before: u64,
}

fn record_config() -> Configuration<LittleEndian, Fixint, NoLimit> {
    bincode::config::standard().with_fixed_int_encoding()
}

/// Create a channel holding at most `capacity` records.
pub fn event_channel(capacity: usize) -> (EventWriter, EventReader) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    (
        EventWriter {
            tx,
            dropped: Arc::clone(&dropped),
        },
        EventReader {
            rx,
            dropped,
            synced: 0,
            pending: None,
        },
    )
}

/// Writing end. Clones share the same channel and drop counter.
#[derive(Clone)]
pub struct EventWriter {
    tx: mpsc::Sender<Frame>,
    dropped: Arc<AtomicU64>,
}

impl EventWriter {
    /// Best-effort, non-blocking write of one event.
    pub fn emit(&self, event: KeyEvent) {
        let mut record: Record = [0; KeyEvent::RECORD_SIZE];
        if bincode::encode_into_slice(event, &mut record, record_config()).is_err() {
            self.dropped.fetch_add(1, Ordering::Release);
            return;
        }
        let frame = Frame {
            record,
            dropped_before: self.dropped.load(Ordering::Acquire),
        };
        match self.tx.try_send(frame) {
            Ok(()) => trace!(%event, "emitted"),
            Err(_) => {
                let total = self.dropped.fetch_add(1, Ordering::Release) + 1;
                trace!(%event, total, "event channel full, dropped");
            }
        }
    }

    /// Records dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Acquire)
    }
}

/// What the reader got from the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    Event(KeyEvent),
    /// `dropped` records were lost here. Every event written before them has
    /// already been delivered.
    Gap { dropped: u64 },
}

/// Reading end.
pub struct EventReader {
    rx: mpsc::Receiver<Frame>,
    dropped: Arc<AtomicU64>,
    /// Drop count already reported as a gap.
    synced: u64,
    /// Event held back while the gap in front of it is reported.
    pending: Option<KeyEvent>,
}

impl EventReader {
    /// Block the calling thread until an event or a gap is available.
    /// Returns [`ChannelError::Closed`] once every writer is gone and the
    /// channel is drained.
    ///
    /// Must not be called from inside an async runtime.
    pub fn receive(&mut self) -> Result<Received, ChannelError> {
        if let Some(event) = self.pending.take() {
            return Ok(Received::Event(event));
        }
        // Read the counter first: if the channel is empty afterwards, every
        // record written before those drops has been delivered.
        let dropped = self.dropped.load(Ordering::Acquire);
        let frame = match self.rx.try_recv() {
            Ok(frame) => frame,
            Err(TryRecvError::Empty) => {
                if let Some(gap) = self.gap(dropped) {
                    return Ok(gap);
                }
                self.rx.blocking_recv().ok_or(ChannelError::Closed)?
            }
            Err(TryRecvError::Disconnected) => return Err(ChannelError::Closed),
        };
        let event = decode(&frame.record)?;
        match self.gap(frame.dropped_before) {
            Some(gap) => {
                self.pending = Some(event);
                Ok(gap)
            }
            None => Ok(Received::Event(event)),
        }
    }

    /// Async counterpart of [`EventReader::receive`] that skips gap
    /// reporting and yields events only.
    pub async fn recv(&mut self) -> Result<KeyEvent, ChannelError> {
        if let Some(event) = self.pending.take() {
            return Ok(event);
        }
        let frame = self.rx.recv().await.ok_or(ChannelError::Closed)?;
        decode(&frame.record)
    }

    fn gap(&mut self, dropped: u64) -> Option<Received> {
        if dropped > self.synced {
            let gap = Received::Gap {
                dropped: dropped - self.synced,
            };
            self.synced = dropped;
            Some(gap)
        } else {
            None
        }
    }
}

fn decode(record: &[u8]) -> Result<KeyEvent, ChannelError> {
    let (event, len): (KeyEvent, usize) = bincode::decode_from_slice(record, record_config())
        .map_err(|e| ChannelError::Decode(e.to_string()))?;
    if len == KeyEvent::RECORD_SIZE {
        Ok(event)
    } else {
        Err(ChannelError::ShortRecord {
            len,
            expected: KeyEvent::RECORD_SIZE,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(received: Received) -> KeyEvent {
        match received {
            Received::Event(event) => event,
            Received::Gap { dropped } => panic!("unexpected gap of {dropped}"),
        }
    }

    #[test]
    fn records_arrive_in_emission_order() {
        let (writer, mut reader) = event_channel(8);
        writer.emit(KeyEvent::down(7, 5));
        writer.emit(KeyEvent::down(7, 6));
        writer.emit(KeyEvent::up(7, 5));

        assert_eq!(event(reader.receive().unwrap()), KeyEvent::down(7, 5));
        assert_eq!(event(reader.receive().unwrap()), KeyEvent::down(7, 6));
        assert_eq!(event(reader.receive().unwrap()), KeyEvent::up(7, 5));
    }

    #[test]
    fn gap_is_reported_after_the_records_written_before_it() {
        let (writer, mut reader) = event_channel(2);
        for code in 4..8 {
            writer.emit(KeyEvent::down(7, code));
        }
        assert_eq!(writer.dropped(), 2);

        assert_eq!(reader.receive().unwrap(), Received::Event(KeyEvent::down(7, 4)));
        assert_eq!(reader.receive().unwrap(), Received::Event(KeyEvent::down(7, 5)));
        // the channel ran empty after the drops, so the gap comes now
        assert_eq!(reader.receive().unwrap(), Received::Gap { dropped: 2 });
    }

    #[test]
    fn gap_precedes_the_first_record_after_a_loss() {
        let (writer, mut reader) = event_channel(1);
        writer.emit(KeyEvent::down(7, 4));
        writer.emit(KeyEvent::up(7, 4));
        assert_eq!(reader.receive().unwrap(), Received::Event(KeyEvent::down(7, 4)));

        writer.emit(KeyEvent::down(7, 5));
        assert_eq!(reader.receive().unwrap(), Received::Gap { dropped: 1 });
        assert_eq!(reader.receive().unwrap(), Received::Event(KeyEvent::down(7, 5)));
    }

    #[test]
    fn each_loss_is_reported_once() {
        let (writer, mut reader) = event_channel(1);
        writer.emit(KeyEvent::down(7, 4));
        writer.emit(KeyEvent::up(7, 4));
        assert!(matches!(reader.receive().unwrap(), Received::Event(_)));
        assert_eq!(reader.receive().unwrap(), Received::Gap { dropped: 1 });

        writer.emit(KeyEvent::down(7, 5));
        assert_eq!(reader.receive().unwrap(), Received::Event(KeyEvent::down(7, 5)));
    }

    #[test]
    fn receive_reports_closed_after_writers_drop() {
        let (writer, mut reader) = event_channel(4);
        writer.emit(KeyEvent::down(7, 4));
        drop(writer);
        assert!(reader.receive().is_ok());
        assert!(matches!(reader.receive(), Err(ChannelError::Closed)));
    }

    #[test]
    fn write_after_reader_drop_is_counted_not_fatal() {
        let (writer, reader) = event_channel(4);
        drop(reader);
        writer.emit(KeyEvent::down(7, 4));
        assert_eq!(writer.dropped(), 1);
    }

    #[test]
    fn receive_blocks_until_another_thread_writes() {
        let (writer, mut reader) = event_channel(4);
        let producer = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            writer.emit(KeyEvent::new(2, 0x0C, 0xE9));
        });
        assert_eq!(
            reader.receive().unwrap(),
            Received::Event(KeyEvent::new(2, 0x0C, 0xE9))
        );
        producer.join().unwrap();
    }

    #[test]
    fn truncated_record_is_rejected() {
        assert!(decode(&[1, 0, 0]).is_err());
    }
}
