//! Persistent DSA statistics.
//!
//! A line oriented text file under the per-user cache directory:
//!
//! ```text
//! DDCIO-DSA-CACHE VERSION 1 GENERATION 2
//! # bus step ewma_attempts ewma_greatest timestamp edid_check_byte
//! 3 7 1.3 1.9 1760000000 a5
//! 5 6 1 1 1760000123 -
//! ```
//!
//! Every access holds an exclusive `flock` on a sibling `.lock` file. Writers write a temporary
//! file and rename it over the cache. A restore keeps the lock from reading until any erase of
//! an invalid file, so a concurrent save is never lost.

use std::{
    collections::BTreeMap,
    fmt::Write as _,
    fs::{self, File, OpenOptions},
    io::{self, Write as _},
    os::fd::AsRawFd,
    path::{Path, PathBuf},
};

use ddcio_common::Status;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::{DsaGeneration, STEP_LAST};

const MAGIC: &str = "DDCIO-DSA-CACHE";

/// Bumped whenever the record layout changes.
pub const CACHE_VERSION: u32 = 1;

const FILE_NAME: &str = "stats";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("no per-user cache directory")]
    NoCacheDir,
    #[error("cache version {found}, expected {expected}")]
    Version { found: u32, expected: u32 },
    #[error("cache generation {found}, expected {expected}")]
    Generation { found: u32, expected: u32 },
    #[error("cache corrupt at line {line}: {reason}")]
    Corrupt { line: usize, reason: &'static str },
    #[error("cache I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CacheError {
    pub fn status(&self) -> Status {
        match self {
            Self::Io(e) => Status::from(io::Error::from(e.kind())),
            _ => Status::BadData,
        }
    }
}

/// The persistent part of one device's DSA state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CachedRecord {
    pub busno: u32,
    pub step: usize,
    pub ewma_attempts: f32,
    pub ewma_greatest: f32,
    pub timestamp: u64,
    pub edid_check_byte: Option<u8>,
}

impl CachedRecord {
    fn parse(line: &str, lineno: usize) -> Result<Self, CacheError> {
        let corrupt = |reason| CacheError::Corrupt { line: lineno, reason };

        let fields: Vec<_> = line.split_whitespace().collect();
        if fields.len() != 6 {
            return Err(corrupt("expected 6 fields"));
        }

        let busno = fields[0].parse().map_err(|_| corrupt("bad bus number"))?;
        let step = fields[1].parse().map_err(|_| corrupt("bad step"))?;
        if step > STEP_LAST {
            return Err(corrupt("step out of range"));
        }

        let ewma = |s: &str| match s.parse::<f32>() {
            Ok(v) if v.is_finite() && v >= 0.0 => Ok(v),
            _ => Err(corrupt("bad ewma")),
        };
        let ewma_attempts = ewma(fields[2])?;
        let ewma_greatest = ewma(fields[3])?;

        let timestamp = fields[4].parse().map_err(|_| corrupt("bad timestamp"))?;
        let edid_check_byte = match fields[5] {
            "-" => None,
            hex => Some(u8::from_str_radix(hex, 16).map_err(|_| corrupt("bad edid byte"))?),
        };

        Ok(Self { busno, step, ewma_attempts, ewma_greatest, timestamp, edid_check_byte })
    }

    fn write_line(&self, out: &mut String) {
        let _ = write!(
            out,
            "{} {} {} {} {} ",
            self.busno, self.step, self.ewma_attempts, self.ewma_greatest, self.timestamp
        );
        match self.edid_check_byte {
            Some(b) => {
                let _ = writeln!(out, "{b:02x}");
            }
            None => out.push_str("-\n"),
        }
    }
}

/// Handle to the stats cache file.
#[derive(Debug, Clone)]
pub struct StatsCache {
    path: PathBuf,
}

impl StatsCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The cache in the per-user cache directory.
    pub fn default_location() -> Result<Self, CacheError> {
        let dir = dirs::cache_dir().ok_or(CacheError::NoCacheDir)?;
        Ok(Self::new(dir.join("ddcio").join(FILE_NAME)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("lock")
    }

    fn open_lock(&self, operation: libc::c_int) -> Result<File, CacheError> {
        let file = OpenOptions::new().create(true).append(true).open(self.lock_path())?;
        // SAFETY: plain syscall on an owned descriptor. Released when `file` is dropped.
        if unsafe { libc::flock(file.as_raw_fd(), operation) } != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(file)
    }

    /// Writes `records` for `generation`, replacing the previous contents.
    #[instrument(skip_all, fields(path = %self.path.display(), records = records.len()))]
    pub fn save(
        &self,
        generation: DsaGeneration,
        records: &[CachedRecord],
    ) -> Result<(), CacheError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }

        let mut out = format!("{MAGIC} VERSION {CACHE_VERSION} GENERATION {}\n", generation.tag());
        out.push_str("# bus step ewma_attempts ewma_greatest timestamp edid_check_byte\n");

        let sorted: BTreeMap<_, _> = records.iter().map(|r| (r.busno, r)).collect();
        for record in sorted.values() {
            record.write_line(&mut out);
        }

        let _lock = self.open_lock(libc::LOCK_EX)?;
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(out.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        info!("saved DSA stats cache");
        Ok(())
    }

    /// Reads the cache. A missing file is an empty cache. A file with the wrong version or
    /// generation, or with any invalid record, is erased and reported as an error; none of its
    /// records are returned.
    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub fn restore(&self, generation: DsaGeneration) -> Result<Vec<CachedRecord>, CacheError> {
        let _lock = self.open_lock(libc::LOCK_EX)?;
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("no DSA stats cache");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        match Self::parse(&text, generation) {
            Ok(records) => {
                info!(records = records.len(), "restored DSA stats cache");
                Ok(records)
            }
            Err(e) => {
                warn!(error = %e, "discarding DSA stats cache");
                if let Err(erase) = self.remove_file() {
                    warn!(error = %erase, "failed to erase DSA stats cache");
                }
                Err(e)
            }
        }
    }

    /// Deletes the cache file.
    pub fn erase(&self) -> Result<(), CacheError> {
        let _lock = self.open_lock(libc::LOCK_EX)?;
        self.remove_file()
    }

    /// Callers hold the lock.
    fn remove_file(&self) -> Result<(), CacheError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn parse(text: &str, generation: DsaGeneration) -> Result<Vec<CachedRecord>, CacheError> {
        let mut lines = text.lines().enumerate().map(|(i, l)| (i + 1, l.trim()));

        let Some((_, header)) = lines.next() else {
            return Err(CacheError::Corrupt { line: 1, reason: "empty file" });
        };
        let (version, found_generation) = parse_header(header)?;
        if version != CACHE_VERSION {
            return Err(CacheError::Version { found: version, expected: CACHE_VERSION });
        }
        if found_generation != generation.tag() {
            return Err(CacheError::Generation {
                found: found_generation,
                expected: generation.tag(),
            });
        }

        let mut records = Vec::new();
        for (lineno, line) in lines {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let record = CachedRecord::parse(line, lineno)?;
            if records.iter().any(|r: &CachedRecord| r.busno == record.busno) {
                return Err(CacheError::Corrupt { line: lineno, reason: "duplicate bus" });
            }
            records.push(record);
        }

        Ok(records)
    }
}

fn parse_header(header: &str) -> Result<(u32, u32), CacheError> {
    let corrupt = |reason| CacheError::Corrupt { line: 1, reason };
    let fields: Vec<_> = header.split_whitespace().collect();
    match fields.as_slice() {
        [MAGIC, "VERSION", v, "GENERATION", g] => {
            let version = v.parse().map_err(|_| corrupt("bad version"))?;
            let generation = g.parse().map_err(|_| corrupt("bad generation"))?;
            Ok((version, generation))
        }
        _ => Err(corrupt("bad header")),
    }
}
