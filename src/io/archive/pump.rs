//! Archive readers borrow their underlying stream for as long as an entry is
//! open, which a source that hands entries to independently owned children
//! cannot express. The entries are instead walked by a background thread that
//! streams each file's bytes over a bounded channel, and the archive side reads
//! them back through [`EntryReader`].
//!
//! Zip entries are always read through the archive's central directory, which
//! is the only place entries written with a trailing data descriptor record
//! their sizes. A zip that is not a seekable file is spooled to a temporary file
//! first.
use std::fs;
use std::io::{self, prelude::*, BufReader};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, trace, warn};

use crate::io::compression::{BoxedReader, StreamFormat};

const CHUNK_SIZE: usize = 64 * 1024;
const CHANNEL_CAPACITY: usize = 4;

/// What an archive declares about one of its entries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMeta {
    pub name: String,
    /// The uncompressed size
    pub size: u64,
    /// The stored size, zero when the backend does not record one
    pub compressed_size: u64,
}

impl EntryMeta {
    /// The declared expansion ratio, when the backend records one
    pub fn compression_ratio(&self) -> Option<f64> {
        (self.compressed_size > 0).then(|| self.size as f64 / self.compressed_size as f64)
    }
}

#[derive(Debug)]
pub(crate) enum PumpMessage {
    Entry(EntryMeta),
    Chunk(Vec<u8>),
    EndOfEntry,
    Failed(io::Error),
    Finished,
}

enum PumpStop {
    /// The receiving side went away
    Disconnected,
    Failed(io::Error),
}

impl From<io::Error> for PumpStop {
    fn from(value: io::Error) -> Self {
        Self::Failed(value)
    }
}

fn send(tx: &Sender<PumpMessage>, message: PumpMessage) -> Result<(), PumpStop> {
    tx.send(message).map_err(|_| PumpStop::Disconnected)
}

fn send_entry(
    tx: &Sender<PumpMessage>,
    meta: EntryMeta,
    entry: &mut impl Read,
) -> Result<(), PumpStop> {
    trace!("Streaming archive entry {}", meta.name);
    send(tx, PumpMessage::Entry(meta))?;
    loop {
        let mut chunk = vec![0u8; CHUNK_SIZE];
        let n = match entry.read(&mut chunk) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        if n == 0 {
            break;
        }
        chunk.truncate(n);
        send(tx, PumpMessage::Chunk(chunk))?;
    }
    send(tx, PumpMessage::EndOfEntry)
}

fn walk_zip<R: Read + Seek>(reader: R, tx: &Sender<PumpMessage>) -> Result<(), PumpStop> {
    let mut archive = zip::ZipArchive::new(reader).map_err(|e| {
        io::Error::new(io::ErrorKind::InvalidData, format!("unreadable zip archive: {e}"))
    })?;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(io::Error::other)?;
        if !entry.is_file() {
            continue;
        }
        let meta = EntryMeta {
            name: entry.name().to_string(),
            size: entry.size(),
            compressed_size: entry.compressed_size(),
        };
        send_entry(tx, meta, &mut entry)?;
    }
    Ok(())
}

fn pump_zip(mut reader: BoxedReader, tx: &Sender<PumpMessage>) -> Result<(), PumpStop> {
    let mut spool = tempfile::tempfile()?;
    let spooled = io::copy(&mut reader, &mut spool)?;
    trace!("Spooled {spooled} bytes of zip stream");
    spool.rewind()?;
    walk_zip(BufReader::new(spool), tx)
}

fn pump_tar(reader: BoxedReader, tx: &Sender<PumpMessage>) -> Result<(), PumpStop> {
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let meta = EntryMeta {
            name: entry.path()?.to_string_lossy().to_string(),
            size: entry.size(),
            compressed_size: 0,
        };
        send_entry(tx, meta, &mut entry)?;
    }
    Ok(())
}

/// The consuming end of a background thread walking the entries of one archive
pub(crate) struct EntryPump {
    name: String,
    rx: Option<Receiver<PumpMessage>>,
    /// Whether the open entry's bytes have all been consumed
    entry_done: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

/// Where an [`EntryPump`] reads its archive from
pub(crate) enum PumpInput {
    /// A forward-only stream of the given archive format
    Stream(StreamFormat, BoxedReader),
    /// A zip archive on disk
    ZipFile(fs::File),
}

impl EntryPump {
    pub(crate) fn spawn(input: PumpInput, name: &str) -> io::Result<Self> {
        let (tx, rx) = bounded(CHANNEL_CAPACITY);
        let thread_name = name.to_string();
        let handle = thread::Builder::new()
            .name("archive-entries".to_string())
            .spawn(move || {
                let result = match input {
                    PumpInput::ZipFile(file) => walk_zip(BufReader::new(file), &tx),
                    PumpInput::Stream(StreamFormat::Zip, reader) => pump_zip(reader, &tx),
                    PumpInput::Stream(StreamFormat::Tar, reader) => pump_tar(reader, &tx),
                    PumpInput::Stream(other, _) => Err(PumpStop::Failed(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("{other} is not an archive format"),
                    ))),
                };
                match result {
                    Ok(()) => {
                        let _ = tx.send(PumpMessage::Finished);
                    }
                    Err(PumpStop::Failed(e)) => {
                        debug!("Failed reading entries of {thread_name}: {e}");
                        let _ = tx.send(PumpMessage::Failed(e));
                    }
                    Err(PumpStop::Disconnected) => {
                        trace!("Stopped reading entries of {thread_name}");
                    }
                }
            })?;
        Ok(Self {
            name: name.to_string(),
            rx: Some(rx),
            entry_done: Arc::new(AtomicBool::new(true)),
            handle: Some(handle),
        })
    }

    fn receive(&self) -> io::Result<PumpMessage> {
        let Some(rx) = self.rx.as_ref() else {
            return Ok(PumpMessage::Finished);
        };
        rx.recv().map_err(|_| {
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("the entry reader of {} stopped early", self.name),
            )
        })
    }

    /// Skip whatever the previous entry's reader left unread
    fn skip_rest_of_entry(&mut self) -> io::Result<()> {
        while !self.entry_done.load(Ordering::Acquire) {
            match self.receive()? {
                PumpMessage::Chunk(_) => {}
                PumpMessage::EndOfEntry => self.entry_done.store(true, Ordering::Release),
                PumpMessage::Failed(e) => {
                    self.entry_done.store(true, Ordering::Release);
                    return Err(e);
                }
                PumpMessage::Finished => {
                    self.entry_done.store(true, Ordering::Release);
                    self.shutdown();
                }
                PumpMessage::Entry(meta) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("entry {} began before the previous one ended", meta.name),
                    ))
                }
            }
        }
        Ok(())
    }

    /// Advance to the next file entry, returning its description and a reader
    /// over its bytes.
    pub(crate) fn next_entry(&mut self) -> io::Result<Option<(EntryMeta, EntryReader)>> {
        self.skip_rest_of_entry()?;
        let Some(rx) = self.rx.as_ref() else {
            return Ok(None);
        };
        match self.receive()? {
            PumpMessage::Entry(meta) => {
                self.entry_done.store(false, Ordering::Release);
                let reader = EntryReader {
                    rx: rx.clone(),
                    chunk: Vec::new(),
                    position: 0,
                    entry_done: self.entry_done.clone(),
                };
                Ok(Some((meta, reader)))
            }
            PumpMessage::Finished => {
                self.shutdown();
                Ok(None)
            }
            PumpMessage::Failed(e) => {
                self.shutdown();
                Err(e)
            }
            PumpMessage::Chunk(_) | PumpMessage::EndOfEntry => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("the entries of {} are out of sync", self.name),
            )),
        }
    }

    /// Stop the background thread. Every [`EntryReader`] handed out must already
    /// be dropped, or this blocks until it is.
    pub(crate) fn shutdown(&mut self) {
        self.rx = None;
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("The entry reader of {} panicked", self.name);
            }
        }
    }
}

impl Drop for EntryPump {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A forward-only view of the bytes of one archive entry
pub(crate) struct EntryReader {
    rx: Receiver<PumpMessage>,
    chunk: Vec<u8>,
    position: usize,
    entry_done: Arc<AtomicBool>,
}

impl Read for EntryReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.position < self.chunk.len() {
                let n = buf.len().min(self.chunk.len() - self.position);
                buf[..n].copy_from_slice(&self.chunk[self.position..self.position + n]);
                self.position += n;
                return Ok(n);
            }
            if self.entry_done.load(Ordering::Acquire) || buf.is_empty() {
                return Ok(0);
            }
            match self.rx.recv() {
                Ok(PumpMessage::Chunk(chunk)) => {
                    self.chunk = chunk;
                    self.position = 0;
                }
                Ok(PumpMessage::EndOfEntry) => {
                    self.entry_done.store(true, Ordering::Release);
                    return Ok(0);
                }
                Ok(PumpMessage::Failed(e)) => {
                    self.entry_done.store(true, Ordering::Release);
                    return Err(e);
                }
                Ok(message) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("unexpected {message:?} inside an archive entry"),
                    ))
                }
                Err(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "the archive entry reader stopped early",
                    ))
                }
            }
        }
    }
}
