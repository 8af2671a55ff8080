//! Native file format.
//!
//! ```text
//! "DAQL" | header_len u32 | bincode(FileHeader) | record*
//! ```
//!
//! Without compression a record is a bare event encoding. With lz4 each
//! record is a length-prefixed lz4 block holding one event encoding.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use chrono::{DateTime, Utc};
use serde_repr::{Deserialize_repr, Serialize_repr};

use super::{expand_pattern, FileReader, FileWriter, DEFAULT_PATTERN};
use crate::event::ByteReader;
#[cfg(feature = "lz4")]
use crate::event::ByteWriter;
use crate::{Configuration, Error, Event, Registry, Result};

pub const NATIVE_EXTENSION: &str = ".raw";

const MAGIC: &[u8; 4] = b"DAQL";
const FORMAT_VERSION: u8 = 1;
const MAX_HEADER_LEN: usize = 64 * 1024;

#[derive(Serialize_repr, Deserialize_repr, Copy, Clone, Debug, PartialEq)]
#[repr(u8)]
pub enum Compression {
    None = 0,
    Lz4 = 1,
}

impl std::str::FromStr for Compression {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "" | "none" => Ok(Compression::None),
            "lz4" => Ok(Compression::Lz4),
            _ => Err(Error::ConfigError(format!("unknown compression: {}", s))),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FileHeader {
    pub version: u8,
    pub compression: Compression,
    pub created: DateTime<Utc>,
    pub run_n: u32,
}

/// Writes one file per run, named after a pattern.
pub struct NativeWriter {
    pattern: String,
    compression: Compression,
    overwrite: bool,
    file: Option<BufWriter<File>>,
    path: Option<PathBuf>,
    bytes: u64,
}

impl NativeWriter {
    pub fn new(pattern: &str) -> Self {
        Self {
            pattern: pattern.to_string(),
            compression: Compression::None,
            overwrite: false,
            file: None,
            path: None,
            bytes: 0,
        }
    }

    /// Creates a writer from `FilePattern`, `Compression` and `Overwrite`
    /// keys.
    pub fn from_config(config: &Configuration) -> Result<Self> {
        let compression = config.get_str("Compression", "none").parse()?;
        Ok(Self::new(&config.get_str("FilePattern", DEFAULT_PATTERN))
            .with_compression(compression)
            .with_overwrite(config.get_bool("Overwrite", false)))
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Path of the file for the current run.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let file = self.file.as_mut().ok_or(Error::NoRunStarted)?;
        file.write_all(bytes)?;
        self.bytes += bytes.len() as u64;
        Ok(())
    }
}

impl FileWriter for NativeWriter {
    fn start_run(&mut self, run_n: u32) -> Result<()> {
        if self.compression == Compression::Lz4 && !cfg!(feature = "lz4") {
            return Err(Error::ConfigError(
                "lz4 compression not available in this build".to_string(),
            ));
        }
        if let Some(mut previous) = self.file.take() {
            previous.flush()?;
        }
        let created = Utc::now();
        let path = expand_pattern(&self.pattern, run_n, NATIVE_EXTENSION, created);

        let mut options = OpenOptions::new();
        options.write(true);
        if self.overwrite {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }
        let file = options
            .open(&path)
            .map_err(|e| Error::from_create_at(e, &path))?;
        info!("writing run {} to {}", run_n, path);

        self.file = Some(BufWriter::new(file));
        self.path = Some(PathBuf::from(&path));
        self.bytes = 0;

        let header = bincode::serialize(&FileHeader {
            version: FORMAT_VERSION,
            compression: self.compression,
            created,
            run_n,
        })?;
        let mut len = [0; 4];
        LittleEndian::write_u32(&mut len, header.len() as u32);
        self.write_bytes(MAGIC)?;
        self.write_bytes(&len)?;
        self.write_bytes(&header)
    }

    fn write_event(&mut self, event: &Event) -> Result<()> {
        let bytes = event.to_bytes();
        match self.compression {
            Compression::None => self.write_bytes(&bytes),
            #[cfg(feature = "lz4")]
            Compression::Lz4 => {
                let block = lz4::block::compress(&bytes, None, true)?;
                let mut w = ByteWriter::new();
                w.put_bytes(&block);
                self.write_bytes(&w.into_inner())
            }
            #[cfg(not(feature = "lz4"))]
            Compression::Lz4 => Err(Error::ConfigError(
                "lz4 compression not available in this build".to_string(),
            )),
        }
    }

    fn file_bytes(&self) -> u64 {
        self.bytes
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

/// Sequential reader over a native file.
pub struct NativeReader {
    reader: ByteReader<'static>,
    header: FileHeader,
    registry: Arc<Registry>,
}

impl NativeReader {
    pub fn open<P: AsRef<Path>>(path: P, registry: Arc<Registry>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let file = File::open(path.as_ref()).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(path_str.clone()),
            _ => Error::ReadFailure(format!("{}: {}", path_str, e)),
        })?;
        let mut reader = ByteReader::new(BufReader::new(file));

        let mut magic = [0; 4];
        reader
            .read_exact(&mut magic)
            .map_err(|_| Error::ReadFailure(format!("{}: file too short", path_str)))?;
        if &magic != MAGIC {
            return Err(Error::ReadFailure(format!(
                "{}: not a native data file",
                path_str
            )));
        }
        let header_len = reader.read_u32()? as usize;
        if header_len > MAX_HEADER_LEN {
            return Err(Error::ReadFailure(format!(
                "{}: header length {} out of range",
                path_str, header_len
            )));
        }
        let mut header_bytes = vec![0; header_len];
        reader.read_exact(&mut header_bytes)?;
        let header: FileHeader = bincode::deserialize(&header_bytes)
            .map_err(|e| Error::ReadFailure(format!("{}: bad header: {}", path_str, e)))?;
        if header.version != FORMAT_VERSION {
            return Err(Error::ReadFailure(format!(
                "{}: unsupported format version {}",
                path_str, header.version
            )));
        }
        debug!("opened {} (run {}, {:?})", path_str, header.run_n, header.compression);

        Ok(Self {
            reader,
            header,
            registry,
        })
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }
}

impl FileReader for NativeReader {
    fn next_event(&mut self) -> Result<Option<Event>> {
        if self.reader.is_at_end()? {
            return Ok(None);
        }
        match self.header.compression {
            Compression::None => self.registry.decode(&mut self.reader).map(Some),
            #[cfg(feature = "lz4")]
            Compression::Lz4 => {
                let block = self.reader.read_bytes()?;
                let data = lz4::block::decompress(&block, None)
                    .map_err(|e| Error::DecompressionError(e.to_string()))?;
                self.registry.decode_bytes(&data).map(Some)
            }
            #[cfg(not(feature = "lz4"))]
            Compression::Lz4 => Err(Error::ReadFailure(
                "lz4 compression not available in this build".to_string(),
            )),
        }
    }
}

#[cfg(test)]
fn temp_pattern(name: &str) -> String {
    let dir = std::env::temp_dir().join(format!("daqline-{}-{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir.join("run$6R$X").to_string_lossy().to_string()
}

#[cfg(test)]
fn write_read(pattern: &str, compression: Compression) -> Vec<Event> {
    let mut writer = NativeWriter::new(pattern).with_compression(compression);
    writer.start_run(5).unwrap();
    let mut bore = Event::base();
    bore.set_flag(crate::Flags::BORE);
    writer.write_event(&bore).unwrap();
    for n in 0..10 {
        let mut event = Event::raw("plane");
        event.set_event_n(n);
        event.set_timestamp(n as u64 * 10, n as u64 * 10 + 5);
        writer.write_event(&event).unwrap();
    }
    writer.flush().unwrap();
    assert!(writer.file_bytes() > 0);
    let path = writer.path().unwrap().to_path_buf();
    assert!(path.to_string_lossy().ends_with("run000005.raw"));

    let mut reader = NativeReader::open(&path, Arc::new(Registry::with_builtins())).unwrap();
    assert_eq!(reader.header().run_n, 5);
    let mut events = Vec::new();
    while let Some(event) = reader.next_event().unwrap() {
        events.push(event);
    }
    events
}

#[test]
fn native_file_round_trip() {
    let events = write_read(&temp_pattern("plain"), Compression::None);
    assert_eq!(events.len(), 11);
    assert!(events[0].is_bore());
    assert_eq!(events[10].event_n(), 9);
    assert_eq!(events[10].timestamp_begin(), Some(90));
}

#[cfg(feature = "lz4")]
#[test]
fn compressed_file_round_trip() {
    let events = write_read(&temp_pattern("lz4"), Compression::Lz4);
    assert_eq!(events.len(), 11);
    assert_eq!(events[3].event_n(), 2);
}

#[test]
fn existing_file_is_not_overwritten() {
    let pattern = temp_pattern("exists");
    let mut writer = NativeWriter::new(&pattern);
    writer.start_run(1).unwrap();
    writer.flush().unwrap();

    let mut second = NativeWriter::new(&pattern);
    match second.start_run(1) {
        Err(Error::AlreadyExists(_)) => (),
        other => panic!("expected already exists, got {:?}", other),
    }
    let mut forced = NativeWriter::new(&pattern).with_overwrite(true);
    assert!(forced.start_run(1).is_ok());
}

#[test]
fn missing_file_is_not_found() {
    let registry = Arc::new(Registry::with_builtins());
    match NativeReader::open("/nonexistent/daqline/run.raw", registry) {
        Err(Error::NotFound(_)) => (),
        Err(e) => panic!("expected not found, got {:?}", e),
        Ok(_) => panic!("expected not found"),
    }
}
