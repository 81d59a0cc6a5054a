//! MODULE `codec`: framed reader/writer for the on-disk database format
//! (spec.md §4.2, §6).
//!
//! Header: magic `\0mlocate`, version byte, visibility-flag byte, u32 BE
//! config-block length, NUL-terminated scan root, then that many bytes of
//! opaque configuration. Followed by directory records: u64 BE seconds,
//! u32 BE nanoseconds, NUL-terminated absolute path, then entries
//! terminated by `EntryType::End`.

use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};

use crate::dirmodel::{Directory, Entry, Timestamp};
use crate::error::{CoreError, CoreResult};

pub const MAGIC: [u8; 8] = *b"\0mlocate";
pub const VERSION_0: u8 = 0;

/// Minimum internal buffer size for the streaming reader (spec.md §4.2).
pub const MIN_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryType {
    Normal = 0,
    Directory = 1,
    End = 2,
}

impl EntryType {
    fn from_byte(b: u8) -> CoreResult<Self> {
        match b {
            0 => Ok(EntryType::Normal),
            1 => Ok(EntryType::Directory),
            2 => Ok(EntryType::End),
            _ => Err(CoreError::BadFormat {
                path: Default::default(),
                reason: format!("unknown entry type byte {b}"),
            }),
        }
    }
}

/// Frozen header fields read from (or about to be written to) a database.
#[derive(Debug, Clone)]
pub struct Header {
    pub version: u8,
    pub check_visibility: bool,
    pub scan_root: Vec<u8>,
    pub config_block: Vec<u8>,
}

/// Streaming writer over any `Write` sink. Buffered, big-endian.
pub struct Writer<W: Write> {
    inner: BufWriter<W>,
    bytes_written: u64,
}

impl<W: Write> Writer<W> {
    pub fn new(inner: W) -> Self {
        Writer { inner: BufWriter::with_capacity(MIN_BUFFER_SIZE, inner), bytes_written: 0 }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.inner.write_all(buf)?;
        self.bytes_written += buf.len() as u64;
        Ok(())
    }

    fn write_nul_terminated(&mut self, name: &[u8]) -> CoreResult<()> {
        if name.contains(&0) {
            return Err(CoreError::Config("names containing NUL are forbidden".into()));
        }
        self.write_all(name)?;
        self.write_all(&[0])?;
        Ok(())
    }

    pub fn write_header(&mut self, header: &Header) -> CoreResult<()> {
        if header.config_block.len() > u32::MAX as usize {
            return Err(CoreError::Config("configuration block too large".into()));
        }
        self.write_all(&MAGIC)?;
        self.write_all(&[header.version])?;
        self.write_all(&[header.check_visibility as u8])?;
        self.write_all(&(header.config_block.len() as u32).to_be_bytes())?;
        self.write_nul_terminated(&header.scan_root)?;
        self.write_all(&header.config_block)?;
        Ok(())
    }

    pub fn write_directory(&mut self, dir: &Directory) -> CoreResult<()> {
        self.write_all(&dir.time.sec.to_be_bytes())?;
        self.write_all(&dir.time.nsec.to_be_bytes())?;
        self.write_nul_terminated(&dir.path)?;
        for entry in &dir.entries {
            let ty = if entry.is_directory { EntryType::Directory } else { EntryType::Normal };
            self.write_all(&[ty as u8])?;
            self.write_nul_terminated(&entry.name)?;
        }
        self.write_all(&[EntryType::End as u8])?;
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }

    pub fn get_ref(&self) -> &W {
        self.inner.get_ref()
    }
}

/// Streaming reader over any `Read` source. Reports at most one I/O error
/// per stream via `err`, and exposes a running byte count for statistics
/// mode (spec.md §4.2, §4.7).
pub struct Reader<R: Read> {
    inner: BufReader<R>,
    bytes_read: u64,
    err: Option<io::ErrorKind>,
}

impl<R: Read> Reader<R> {
    pub fn new(inner: R) -> Self {
        Reader { inner: BufReader::with_capacity(MIN_BUFFER_SIZE, inner), bytes_read: 0, err: None }
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn err(&self) -> Option<io::ErrorKind> {
        self.err
    }

    fn read_fixed(&mut self, buf: &mut [u8]) -> io::Result<()> {
        match self.inner.read_exact(buf) {
            Ok(()) => {
                self.bytes_read += buf.len() as u64;
                Ok(())
            }
            Err(e) => {
                if self.err.is_none() {
                    self.err = Some(e.kind());
                }
                Err(e)
            }
        }
    }

    fn read_nul_terminated_name(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        let n = self.inner.read_until(0, &mut buf)?;
        if n == 0 {
            let err = io::Error::new(io::ErrorKind::UnexpectedEof, "unexpected EOF reading name");
            if self.err.is_none() {
                self.err = Some(err.kind());
            }
            return Err(err);
        }
        if buf.last() != Some(&0) {
            let err = io::Error::new(io::ErrorKind::UnexpectedEof, "name missing NUL terminator");
            if self.err.is_none() {
                self.err = Some(err.kind());
            }
            return Err(err);
        }
        buf.pop();
        self.bytes_read += (buf.len() + 1) as u64;
        Ok(buf)
    }

    /// Reads and validates the file header. Fails with `BadFormat` on bad
    /// magic or unknown version (spec.md §4.2).
    pub fn read_header(&mut self) -> CoreResult<Header> {
        let mut magic = [0u8; 8];
        self.read_fixed(&mut magic)?;
        if magic != MAGIC {
            return Err(CoreError::BadFormat { path: Default::default(), reason: "bad magic".into() });
        }
        let mut version = [0u8; 1];
        self.read_fixed(&mut version)?;
        if version[0] != VERSION_0 {
            return Err(CoreError::BadFormat {
                path: Default::default(),
                reason: format!("unknown version {}", version[0]),
            });
        }
        let mut vis = [0u8; 1];
        self.read_fixed(&mut vis)?;
        let check_visibility = match vis[0] {
            0 => false,
            1 => true,
            other => {
                return Err(CoreError::BadFormat {
                    path: Default::default(),
                    reason: format!("bad visibility flag {other}"),
                })
            }
        };
        let mut len_buf = [0u8; 4];
        self.read_fixed(&mut len_buf)?;
        let config_len = u32::from_be_bytes(len_buf) as usize;
        let scan_root = self.read_nul_terminated_name()?;
        let mut config_block = vec![0u8; config_len];
        self.read_fixed(&mut config_block)?;
        Ok(Header { version: version[0], check_visibility, scan_root, config_block })
    }

    /// Reads the next directory record, or `Ok(None)` at a clean EOF
    /// between records (no bytes of the next record have been consumed).
    pub fn read_directory(&mut self) -> CoreResult<Option<Directory>> {
        let mut first_byte = [0u8; 1];
        let n = self.inner.read(&mut first_byte)?;
        if n == 0 {
            return Ok(None);
        }
        self.bytes_read += 1;
        let mut sec_buf = [0u8; 8];
        sec_buf[0] = first_byte[0];
        self.read_fixed(&mut sec_buf[1..])?;
        let mut nsec_buf = [0u8; 4];
        self.read_fixed(&mut nsec_buf)?;
        let time = Timestamp::new(u64::from_be_bytes(sec_buf), u32::from_be_bytes(nsec_buf));
        let path = self.read_nul_terminated_name()?;
        let mut entries = Vec::new();
        loop {
            let mut ty_buf = [0u8; 1];
            self.read_fixed(&mut ty_buf)?;
            match EntryType::from_byte(ty_buf[0])? {
                EntryType::End => break,
                EntryType::Normal => {
                    let name = self.read_nul_terminated_name()?;
                    entries.push(Entry { name, is_directory: false });
                }
                EntryType::Directory => {
                    let name = self.read_nul_terminated_name()?;
                    entries.push(Entry { name, is_directory: true });
                }
            }
        }
        Ok(Some(Directory { path, time, entries }))
    }

    pub fn skip(&mut self, n: u64) -> io::Result<()> {
        let mut remaining = n;
        let mut buf = [0u8; 4096];
        while remaining > 0 {
            let chunk = remaining.min(buf.len() as u64) as usize;
            self.inner.read_exact(&mut buf[..chunk])?;
            self.bytes_read += chunk as u64;
            remaining -= chunk as u64;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn round_trip(header: &Header, dirs: &[Directory]) -> (Header, Vec<Directory>) {
        let mut buf = Vec::new();
        {
            let mut w = Writer::new(&mut buf);
            w.write_header(header).unwrap();
            for d in dirs {
                w.write_directory(d).unwrap();
            }
            w.flush().unwrap();
        }
        let mut r = Reader::new(Cursor::new(buf));
        let h = r.read_header().unwrap();
        let mut out = Vec::new();
        while let Some(d) = r.read_directory().unwrap() {
            out.push(d);
        }
        (h, out)
    }

    #[test]
    fn header_round_trip() {
        let header = Header {
            version: VERSION_0,
            check_visibility: true,
            scan_root: b"/".to_vec(),
            config_block: b"some-config".to_vec(),
        };
        let (h, dirs) = round_trip(&header, &[]);
        assert_eq!(h.scan_root, b"/");
        assert_eq!(h.config_block, b"some-config");
        assert!(h.check_visibility);
        assert!(dirs.is_empty());
    }

    #[test]
    fn directory_round_trip_is_identical() {
        let header = Header { version: VERSION_0, check_visibility: false, scan_root: b"/".to_vec(), config_block: vec![] };
        let dir = Directory {
            path: b"/usr".to_vec(),
            time: Timestamp::new(12345, 678),
            entries: vec![
                Entry { name: b"bin".to_vec(), is_directory: true },
                Entry { name: b"lib".to_vec(), is_directory: true },
                Entry { name: b"README".to_vec(), is_directory: false },
            ],
        };
        let (_h, dirs) = round_trip(&header, std::slice::from_ref(&dir));
        assert_eq!(dirs.len(), 1);
        assert_eq!(dirs[0], dir);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut r = Reader::new(Cursor::new(b"garbage!".to_vec()));
        assert!(r.read_header().is_err());
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut buf = MAGIC.to_vec();
        buf.push(99);
        buf.extend_from_slice(&[0, 0, 0, 0, 0]);
        buf.push(0); // scan root NUL
        let mut r = Reader::new(Cursor::new(buf));
        assert!(r.read_header().is_err());
    }

    #[test]
    fn multiple_directories_preserve_order() {
        let header = Header { version: VERSION_0, check_visibility: false, scan_root: b"/".to_vec(), config_block: vec![] };
        let dirs = vec![
            Directory { path: b"/".to_vec(), time: Timestamp::new(1, 0), entries: vec![] },
            Directory { path: b"/bin".to_vec(), time: Timestamp::new(2, 0), entries: vec![] },
        ];
        let (_h, out) = round_trip(&header, &dirs);
        assert_eq!(out, dirs);
    }
}
