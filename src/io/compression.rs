//! Byte-level sniffing of compressed and archived streams.
//!
//! [`sniff`] classifies the leading bytes of a stream, and [`SniffedReader`]
//! buffers a bounded window of them so the stream can still be read from the
//! start after being classified.
use std::fmt;
use std::io::{self, prelude::*, Cursor};

/// The number of leading bytes inspected. Large enough to reach the tar magic.
pub const SNIFF_WINDOW: usize = 512;

/// Compression layers are peeled at most this many times before giving up
const MAX_COMPRESSION_LAYERS: usize = 4;

const TAR_MAGIC_OFFSET: usize = 257;

/// What a stream's leading bytes say it is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamFormat {
    Gzip,
    Zstd,
    Bzip2,
    Zip,
    Tar,
    /// None of the above, a plain text or XML document
    Plain,
}

impl StreamFormat {
    /// A single compressed stream that decodes to another stream
    pub fn is_compressed(&self) -> bool {
        matches!(self, Self::Gzip | Self::Zstd | Self::Bzip2)
    }

    /// A container of named entries
    pub fn is_archive(&self) -> bool {
        matches!(self, Self::Zip | Self::Tar)
    }

    /// Anything that has to be walked by an archive source rather than parsed directly
    pub fn is_packaged(&self) -> bool {
        self.is_compressed() || self.is_archive()
    }
}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

pub fn is_gzipped(header: &[u8]) -> bool {
    header.starts_with(b"\x1f\x8b")
}

pub fn is_zstd(header: &[u8]) -> bool {
    header.starts_with(b"\x28\xb5\x2f\xfd")
}

pub fn is_bzip2(header: &[u8]) -> bool {
    header.len() >= 10
        && header.starts_with(b"BZh")
        && (b'1'..=b'9').contains(&header[3])
        && (header[4..10] == [0x31, 0x41, 0x59, 0x26, 0x53, 0x59]
            || header[4..10] == [0x17, 0x72, 0x45, 0x38, 0x50, 0x90])
}

pub fn is_zip(header: &[u8]) -> bool {
    header.starts_with(b"PK\x03\x04") || header.starts_with(b"PK\x05\x06")
}

pub fn is_tar(header: &[u8]) -> bool {
    header
        .get(TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + 5)
        .is_some_and(|magic| magic == b"ustar")
}

/// Classify a stream from its leading bytes
pub fn sniff(header: &[u8]) -> StreamFormat {
    if is_gzipped(header) {
        StreamFormat::Gzip
    } else if is_zstd(header) {
        StreamFormat::Zstd
    } else if is_bzip2(header) {
        StreamFormat::Bzip2
    } else if is_zip(header) {
        StreamFormat::Zip
    } else if is_tar(header) {
        StreamFormat::Tar
    } else {
        StreamFormat::Plain
    }
}

const COMPRESSION_EXTENSIONS: &[&str] = &["gz", "gzip", "zst", "zstd", "bz2", "bzip2"];

/// Strip a trailing compression extension from an entry or file name,
/// returning whether one was found.
pub fn strip_compression_extension(name: &str) -> (bool, &str) {
    if let Some((stem, ext)) = name.rsplit_once('.') {
        let ext = ext.to_ascii_lowercase();
        if !stem.is_empty() && COMPRESSION_EXTENSIONS.contains(&ext.as_str()) {
            return (true, stem);
        }
    }
    (false, name)
}

/// A reader that has pulled up to [`SNIFF_WINDOW`] bytes ahead of its inner reader
/// and replays them before continuing with the rest of the stream.
pub struct SniffedReader<R: Read> {
    prefix: Cursor<Vec<u8>>,
    inner: R,
}

impl<R: Read> SniffedReader<R> {
    pub fn new(mut inner: R) -> io::Result<Self> {
        let mut buffer = vec![0u8; SNIFF_WINDOW];
        let mut filled = 0;
        while filled < SNIFF_WINDOW {
            match inner.read(&mut buffer[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        buffer.truncate(filled);
        Ok(Self {
            prefix: Cursor::new(buffer),
            inner,
        })
    }

    /// The buffered leading bytes of the stream
    pub fn header(&self) -> &[u8] {
        self.prefix.get_ref()
    }

    pub fn format(&self) -> StreamFormat {
        sniff(self.header())
    }

    pub fn is_empty(&self) -> bool {
        self.header().is_empty()
    }
}

impl<R: Read> Read for SniffedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.prefix.read(buf)?;
        if n > 0 || buf.is_empty() {
            return Ok(n);
        }
        self.inner.read(buf)
    }
}

pub type BoxedReader = Box<dyn Read + Send>;

/// Wrap `reader` in the decoder for one compression layer
pub fn decode_layer(format: StreamFormat, reader: BoxedReader) -> io::Result<BoxedReader> {
    match format {
        StreamFormat::Gzip => Ok(Box::new(flate2::read::MultiGzDecoder::new(reader))),
        #[cfg(feature = "zstd")]
        StreamFormat::Zstd => Ok(Box::new(zstd::stream::read::Decoder::new(reader)?)),
        #[cfg(feature = "bzip2")]
        StreamFormat::Bzip2 => Ok(Box::new(bzip2::read::MultiBzDecoder::new(reader))),
        #[allow(unreachable_patterns)]
        StreamFormat::Zstd | StreamFormat::Bzip2 => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("{format} decompression support is not enabled"),
        )),
        StreamFormat::Zip | StreamFormat::Tar | StreamFormat::Plain => Ok(reader),
    }
}

/// A stream with every compression layer removed
pub struct Decompressed {
    pub reader: SniffedReader<BoxedReader>,
    /// The format of the fully decompressed payload
    pub format: StreamFormat,
    /// How many compression layers were removed
    pub layers: usize,
}

/// Sniff `reader`, decompressing as many layers as its leading bytes call for
pub fn decompress(reader: BoxedReader) -> io::Result<Decompressed> {
    let mut reader = SniffedReader::new(reader)?;
    let mut layers = 0;
    loop {
        let format = reader.format();
        if !format.is_compressed() {
            return Ok(Decompressed {
                reader,
                format,
                layers,
            });
        }
        if layers == MAX_COMPRESSION_LAYERS {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "too many nested compression layers",
            ));
        }
        reader = SniffedReader::new(decode_layer(format, Box::new(reader))?)?;
        layers += 1;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    #[test]
    fn test_sniff() {
        assert_eq!(sniff(b"\x1f\x8b\x08\x00"), StreamFormat::Gzip);
        assert_eq!(sniff(b"\x28\xb5\x2f\xfd\x00"), StreamFormat::Zstd);
        assert_eq!(sniff(b"BZh91AY&SYxxxx"), StreamFormat::Bzip2);
        assert_eq!(sniff(b"PK\x03\x04rest"), StreamFormat::Zip);
        assert_eq!(sniff(b"BEGIN IONS\n"), StreamFormat::Plain);
        assert_eq!(sniff(b"BZh is not enough"), StreamFormat::Plain);
        assert_eq!(sniff(b""), StreamFormat::Plain);

        let mut tar_header = vec![0u8; 512];
        tar_header[257..262].copy_from_slice(b"ustar");
        assert_eq!(sniff(&tar_header), StreamFormat::Tar);
    }

    #[test]
    fn test_strip_extension() {
        assert_eq!(strip_compression_extension("a.mgf.gz"), (true, "a.mgf"));
        assert_eq!(strip_compression_extension("a.apl.ZST"), (true, "a.apl"));
        assert_eq!(strip_compression_extension("a.mgf"), (false, "a.mgf"));
        assert_eq!(strip_compression_extension(".gz"), (false, ".gz"));
    }

    #[test]
    fn test_sniffed_reader_replays() -> io::Result<()> {
        let data: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        let mut reader = SniffedReader::new(Cursor::new(data.clone()))?;
        assert_eq!(reader.header().len(), SNIFF_WINDOW);
        let mut out = Vec::new();
        reader.read_to_end(&mut out)?;
        assert_eq!(out, data);
        Ok(())
    }

    #[test]
    fn test_decompress_nested_gzip() -> io::Result<()> {
        let payload = b"BEGIN IONS\nTITLE=x\nEND IONS\n".to_vec();
        let mut inner = GzEncoder::new(Vec::new(), Compression::default());
        inner.write_all(&payload)?;
        let mut outer = GzEncoder::new(Vec::new(), Compression::default());
        outer.write_all(&inner.finish()?)?;
        let bytes = outer.finish()?;

        let mut decoded = decompress(Box::new(Cursor::new(bytes)))?;
        assert_eq!(decoded.layers, 2);
        assert_eq!(decoded.format, StreamFormat::Plain);
        let mut out = Vec::new();
        decoded.reader.read_to_end(&mut out)?;
        assert_eq!(out, payload);
        Ok(())
    }
}
