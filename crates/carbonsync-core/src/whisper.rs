//! Fixed-size round-robin archive files (whisper layout).
//!
//! ```text
//! header        aggregation u32 | maxRetention u32 | xFilesFactor f32 | archiveCount u32
//! archive info  offset u32 | secondsPerPoint u32 | points u32          (x archiveCount)
//! archive data  interval u32 | value f64                              (x points, per archive)
//! ```
//!
//! All fields are big-endian. A slot whose stored interval differs from the
//! interval a reader expects is absent, so stale ring-buffer contents never
//! leak into results.
//!
//! Handles are opened, used and dropped within one call; nothing here caches
//! file descriptors.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::Serialize;

use crate::error::WhisperError;
use crate::model::{AggregationMethod, FetchedSeries, MetricInfo, Point, RetentionTier};

const METADATA_SIZE: u64 = 16;
const ARCHIVE_INFO_SIZE: u64 = 12;
const POINT_SIZE: u64 = 12;
const MAX_ARCHIVES: u32 = 128;

/// Open/create options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Options {
    /// Hold an exclusive advisory lock for the lifetime of the handle.
    pub flock: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ArchiveInfo {
    offset: u32,
    seconds_per_point: u32,
    points: u32,
}

impl ArchiveInfo {
    fn retention(&self) -> u64 {
        u64::from(self.seconds_per_point) * u64::from(self.points)
    }

    fn size(&self) -> u64 {
        u64::from(self.points) * POINT_SIZE
    }

    fn end(&self) -> u64 {
        u64::from(self.offset) + self.size()
    }

    /// Byte offset of `interval` given the archive's base interval.
    fn point_offset(&self, base: u32, interval: u32) -> u64 {
        let time_distance = i64::from(interval) - i64::from(base);
        let point_distance = time_distance / i64::from(self.seconds_per_point);
        let slot = point_distance.rem_euclid(i64::from(self.points)) as u64;
        u64::from(self.offset) + slot * POINT_SIZE
    }

    fn tier(&self) -> RetentionTier {
        RetentionTier::new(self.seconds_per_point, self.points)
    }
}

/// Slots read back from one archive.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeries {
    pub from_interval: u32,
    pub until_interval: u32,
    pub step: u32,
    pub values: Vec<Option<f64>>,
}

impl TimeSeries {
    /// Attach a metric name and split values into the dense + absence form.
    #[must_use]
    pub fn into_fetched(self, name: &str) -> FetchedSeries {
        let is_absent = self.values.iter().map(Option::is_none).collect();
        let values = self.values.iter().map(|v| v.unwrap_or(0.0)).collect();
        FetchedSeries {
            name: name.to_string(),
            start_time: self.from_interval,
            step_time: self.step,
            stop_time: self.until_interval,
            values,
            is_absent,
        }
    }
}

/// Raw file contents, for diagnosis.
#[derive(Debug, Clone, Serialize)]
pub struct WhisperDump {
    pub aggregation_method: AggregationMethod,
    pub max_retention: u32,
    pub x_files_factor: f32,
    pub archives: Vec<ArchiveDump>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveDump {
    pub offset: u32,
    pub seconds_per_point: u32,
    pub points: u32,
    /// Every slot in file order; never-written slots have timestamp 0.
    pub slots: Vec<Point>,
}

/// An open archive file.
#[derive(Debug)]
pub struct WhisperFile {
    path: PathBuf,
    file: File,
    locked: bool,
    aggregation_method: AggregationMethod,
    max_retention: u32,
    x_files_factor: f32,
    archives: Vec<ArchiveInfo>,
}

impl WhisperFile {
    /// Create a new archive. Fails if `path` already exists.
    pub fn create(
        path: &Path,
        tiers: &[RetentionTier],
        aggregation_method: AggregationMethod,
        x_files_factor: f32,
        options: Options,
    ) -> Result<Self, WhisperError> {
        let tiers = validate_tiers(tiers)?;
        if !(0.0..=1.0).contains(&x_files_factor) {
            return Err(WhisperError::InvalidXFilesFactor(x_files_factor));
        }
        let max_retention = tiers.last().map_or(0, RetentionTier::span);
        let max_retention = u32::try_from(max_retention).map_err(|_| {
            WhisperError::InvalidRetentions(format!("max retention {max_retention}s overflows"))
        })?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|source| {
                if source.kind() == io::ErrorKind::AlreadyExists {
                    WhisperError::AlreadyExists(path.to_path_buf())
                } else {
                    io_error(path, source)
                }
            })?;
        if options.flock {
            FileExt::lock_exclusive(&file).map_err(|e| io_error(path, e))?;
        }

        let mut offset = METADATA_SIZE + ARCHIVE_INFO_SIZE * tiers.len() as u64;
        let mut archives = Vec::with_capacity(tiers.len());
        for tier in &tiers {
            let info = ArchiveInfo {
                offset: u32::try_from(offset).map_err(|_| {
                    WhisperError::InvalidRetentions("archive file would exceed 4 GiB".to_string())
                })?,
                seconds_per_point: tier.seconds_per_point,
                points: tier.number_of_points,
            };
            offset = info.end();
            archives.push(info);
        }

        let mut header = Vec::new();
        header.extend_from_slice(&aggregation_method.code().to_be_bytes());
        header.extend_from_slice(&max_retention.to_be_bytes());
        header.extend_from_slice(&x_files_factor.to_be_bytes());
        header.extend_from_slice(&(archives.len() as u32).to_be_bytes());
        for a in &archives {
            header.extend_from_slice(&a.offset.to_be_bytes());
            header.extend_from_slice(&a.seconds_per_point.to_be_bytes());
            header.extend_from_slice(&a.points.to_be_bytes());
        }

        let mut this = Self {
            path: path.to_path_buf(),
            file,
            locked: options.flock,
            aggregation_method,
            max_retention,
            x_files_factor,
            archives,
        };
        this.file.write_all(&header).map_err(|e| io_error(path, e))?;
        // Zero-filled data region: a zero interval marks a never-written slot.
        this.file.set_len(offset).map_err(|e| io_error(path, e))?;
        Ok(this)
    }

    /// Open an existing archive. A missing file is `WhisperError::NotExist`.
    pub fn open(path: &Path, options: Options) -> Result<Self, WhisperError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| {
                if source.kind() == io::ErrorKind::NotFound {
                    WhisperError::NotExist(path.to_path_buf())
                } else {
                    io_error(path, source)
                }
            })?;
        if options.flock {
            FileExt::lock_exclusive(&file).map_err(|e| io_error(path, e))?;
        }

        let mut meta = [0u8; METADATA_SIZE as usize];
        file.read_exact(&mut meta).map_err(|e| corrupt_or_io(path, e))?;
        let code = be_u32(&meta[0..4]);
        let aggregation_method =
            AggregationMethod::from_code(code).ok_or(WhisperError::UnknownAggregation(code))?;
        let max_retention = be_u32(&meta[4..8]);
        let x_files_factor = f32::from_bits(be_u32(&meta[8..12]));
        let count = be_u32(&meta[12..16]);
        if count == 0 || count > MAX_ARCHIVES {
            return Err(corrupt(path, format!("archive count {count}")));
        }

        let mut infos = vec![0u8; (ARCHIVE_INFO_SIZE * u64::from(count)) as usize];
        file.read_exact(&mut infos).map_err(|e| corrupt_or_io(path, e))?;
        let archives: Vec<ArchiveInfo> = infos
            .chunks_exact(ARCHIVE_INFO_SIZE as usize)
            .map(|c| ArchiveInfo {
                offset: be_u32(&c[0..4]),
                seconds_per_point: be_u32(&c[4..8]),
                points: be_u32(&c[8..12]),
            })
            .collect();
        if archives
            .iter()
            .any(|a| a.seconds_per_point == 0 || a.points == 0)
        {
            return Err(corrupt(path, "zero-sized archive".to_string()));
        }

        let len = file.metadata().map_err(|e| io_error(path, e))?.len();
        let needed = archives.iter().map(ArchiveInfo::end).max().unwrap_or(0);
        if len < needed {
            return Err(corrupt(
                path,
                format!("file is {len} bytes, archives need {needed}"),
            ));
        }

        Ok(Self {
            path: path.to_path_buf(),
            file,
            locked: options.flock,
            aggregation_method,
            max_retention,
            x_files_factor,
            archives,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn aggregation_method(&self) -> AggregationMethod {
        self.aggregation_method
    }

    #[must_use]
    pub fn max_retention(&self) -> u32 {
        self.max_retention
    }

    #[must_use]
    pub fn x_files_factor(&self) -> f32 {
        self.x_files_factor
    }

    /// Tiers, finest first.
    #[must_use]
    pub fn retentions(&self) -> Vec<RetentionTier> {
        self.archives.iter().map(ArchiveInfo::tier).collect()
    }

    #[must_use]
    pub fn info(&self, name: &str) -> MetricInfo {
        MetricInfo {
            name: name.to_string(),
            aggregation_method: self.aggregation_method,
            max_retention: self.max_retention,
            x_files_factor: self.x_files_factor,
            retentions: self.retentions(),
        }
    }

    /// Write a batch of points relative to `now`.
    ///
    /// Each point goes to the finest archive whose span still covers its age;
    /// points older than the coarsest span are dropped. Repeated timestamps
    /// resolve to the last one in the batch. Groups are written coarsest
    /// first, so a rollup from a finer archive replaces a direct write to
    /// the same coarse slot.
    pub fn update_many(&mut self, points: &[Point], now: u32) -> Result<(), WhisperError> {
        let mut sorted: Vec<Point> = points.to_vec();
        sorted.sort_by_key(|p| p.timestamp);

        let mut groups: Vec<Vec<Point>> = vec![Vec::new(); self.archives.len()];
        for p in sorted {
            let age = i64::from(now) - i64::from(p.timestamp);
            if let Some(index) = self
                .archives
                .iter()
                .position(|a| age < a.retention() as i64)
            {
                groups[index].push(p);
            }
        }

        for (index, group) in groups.iter().enumerate().rev() {
            if !group.is_empty() {
                self.archive_update_many(index, group)?;
            }
        }
        Ok(())
    }

    fn archive_update_many(&mut self, index: usize, points: &[Point]) -> Result<(), WhisperError> {
        let archive = self.archives[index];
        let aligned = align_points(archive.seconds_per_point, points);
        let Some(&(first_interval, _)) = aligned.first() else {
            return Ok(());
        };

        let mut base = self.read_base_interval(&archive)?;
        if base == 0 {
            base = first_interval;
        }
        for &(interval, value) in &aligned {
            self.write_slot(archive.point_offset(base, interval), interval, value)?;
        }

        let mut higher = index;
        for lower in index + 1..self.archives.len() {
            let lower_step = self.archives[lower].seconds_per_point;
            let mut seen = HashSet::new();
            let mut propagated = false;
            for &(interval, _) in &aligned {
                let lower_interval = interval - interval % lower_step;
                if seen.insert(lower_interval) && self.propagate(lower_interval, higher, lower)? {
                    propagated = true;
                }
            }
            if !propagated {
                break;
            }
            higher = lower;
        }
        Ok(())
    }

    /// Re-aggregate one coarser interval from the finer archive. Returns
    /// whether a value was written.
    fn propagate(
        &mut self,
        lower_interval: u32,
        higher: usize,
        lower: usize,
    ) -> Result<bool, WhisperError> {
        let h = self.archives[higher];
        let l = self.archives[lower];

        let base = self.read_base_interval(&h)?;
        let first = if base == 0 {
            u64::from(h.offset)
        } else {
            h.point_offset(base, lower_interval)
        };
        let count = (l.seconds_per_point / h.seconds_per_point) as usize;
        let slots = self.read_slots(&h, first, count)?;

        let known: Vec<f64> = slots
            .iter()
            .enumerate()
            .filter(|(k, (interval, _))| {
                u64::from(*interval)
                    == u64::from(lower_interval) + *k as u64 * u64::from(h.seconds_per_point)
            })
            .map(|(_, (_, value))| *value)
            .collect();
        if known.is_empty() {
            return Ok(false);
        }
        let known_fraction = known.len() as f32 / count as f32;
        if known_fraction < self.x_files_factor {
            return Ok(false);
        }

        let value = self.aggregation_method.aggregate(&known);
        let lower_base = self.read_base_interval(&l)?;
        let offset = if lower_base == 0 {
            u64::from(l.offset)
        } else {
            l.point_offset(lower_base, lower_interval)
        };
        self.write_slot(offset, lower_interval, value)?;
        Ok(true)
    }

    /// Read `[from, until]` relative to `now`. `None` when the window lies
    /// entirely outside the retained range.
    pub fn fetch(
        &mut self,
        from: u32,
        until: u32,
        now: u32,
    ) -> Result<Option<TimeSeries>, WhisperError> {
        if from > until {
            return Err(WhisperError::InvalidTimeRange { from, until });
        }
        let oldest = now.saturating_sub(self.max_retention);
        if from > now || until < oldest {
            return Ok(None);
        }
        let from = from.max(oldest);
        let until = until.min(now);

        let diff = u64::from(now - from);
        let archive = *self
            .archives
            .iter()
            .find(|a| a.retention() >= diff)
            .or_else(|| self.archives.last())
            .ok_or_else(|| corrupt(&self.path, "no archives".to_string()))?;

        let step = u64::from(archive.seconds_per_point);
        let from_interval = u64::from(from) - u64::from(from) % step + step;
        let mut until_interval = u64::from(until) - u64::from(until) % step + step;
        if from_interval == until_interval {
            until_interval += step;
        }
        let count = ((until_interval - from_interval) / step) as usize;
        let from_interval = u32::try_from(from_interval)
            .map_err(|_| WhisperError::InvalidTimeRange { from, until })?;
        let until_interval = u32::try_from(until_interval)
            .map_err(|_| WhisperError::InvalidTimeRange { from, until })?;

        let base = self.read_base_interval(&archive)?;
        let values = if base == 0 {
            vec![None; count]
        } else {
            let slots =
                self.read_slots(&archive, archive.point_offset(base, from_interval), count)?;
            slots
                .iter()
                .enumerate()
                .map(|(k, (interval, value))| {
                    let expected = u64::from(from_interval) + k as u64 * step;
                    (u64::from(*interval) == expected).then_some(*value)
                })
                .collect()
        };

        Ok(Some(TimeSeries {
            from_interval,
            until_interval,
            step: archive.seconds_per_point,
            values,
        }))
    }

    pub fn dump(&mut self) -> Result<WhisperDump, WhisperError> {
        let mut archives = Vec::with_capacity(self.archives.len());
        for a in self.archives.clone() {
            let slots = self
                .read_slots(&a, u64::from(a.offset), a.points as usize)?
                .into_iter()
                .map(|(interval, value)| Point::new(interval, value))
                .collect();
            archives.push(ArchiveDump {
                offset: a.offset,
                seconds_per_point: a.seconds_per_point,
                points: a.points,
                slots,
            });
        }
        Ok(WhisperDump {
            aggregation_method: self.aggregation_method,
            max_retention: self.max_retention,
            x_files_factor: self.x_files_factor,
            archives,
        })
    }

    /// Flush, release the lock and close the handle.
    pub fn close(self) -> Result<(), WhisperError> {
        self.file.sync_data().map_err(|e| io_error(&self.path, e))?;
        if self.locked {
            FileExt::unlock(&self.file).map_err(|e| io_error(&self.path, e))?;
        }
        Ok(())
    }

    fn read_base_interval(&mut self, archive: &ArchiveInfo) -> Result<u32, WhisperError> {
        let slots = self.read_slots(archive, u64::from(archive.offset), 1)?;
        Ok(slots.first().map_or(0, |(interval, _)| *interval))
    }

    /// Read `count` consecutive slots starting at byte `offset`, wrapping
    /// around the end of the archive.
    fn read_slots(
        &mut self,
        archive: &ArchiveInfo,
        offset: u64,
        count: usize,
    ) -> Result<Vec<(u32, f64)>, WhisperError> {
        let mut out = Vec::with_capacity(count);
        let mut slot = (offset - u64::from(archive.offset)) / POINT_SIZE;
        let mut remaining = count as u64;
        while remaining > 0 {
            let chunk = remaining.min(u64::from(archive.points) - slot);
            let mut buf = vec![0u8; (chunk * POINT_SIZE) as usize];
            self.file
                .seek(SeekFrom::Start(u64::from(archive.offset) + slot * POINT_SIZE))
                .map_err(|e| io_error(&self.path, e))?;
            self.file
                .read_exact(&mut buf)
                .map_err(|e| corrupt_or_io(&self.path, e))?;
            out.extend(buf.chunks_exact(POINT_SIZE as usize).map(|c| {
                let interval = be_u32(&c[0..4]);
                let value = f64::from_bits(be_u64(&c[4..12]));
                (interval, value)
            }));
            remaining -= chunk;
            slot = 0;
        }
        Ok(out)
    }

    fn write_slot(&mut self, offset: u64, interval: u32, value: f64) -> Result<(), WhisperError> {
        let mut buf = [0u8; POINT_SIZE as usize];
        buf[0..4].copy_from_slice(&interval.to_be_bytes());
        buf[4..12].copy_from_slice(&value.to_be_bytes());
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| io_error(&self.path, e))?;
        self.file
            .write_all(&buf)
            .map_err(|e| io_error(&self.path, e))
    }
}

/// Sort finest first and check that each coarser tier can be rolled up
/// from the finer one.
pub fn validate_tiers(tiers: &[RetentionTier]) -> Result<Vec<RetentionTier>, WhisperError> {
    if tiers.is_empty() {
        return Err(WhisperError::InvalidRetentions(
            "no retentions given".to_string(),
        ));
    }
    if tiers.len() > MAX_ARCHIVES as usize {
        return Err(WhisperError::InvalidRetentions(format!(
            "{} retentions exceed the limit of {MAX_ARCHIVES}",
            tiers.len()
        )));
    }
    let mut sorted = tiers.to_vec();
    sorted.sort_by_key(|t| t.seconds_per_point);

    for t in &sorted {
        if t.seconds_per_point == 0 || t.number_of_points == 0 {
            return Err(WhisperError::InvalidRetentions(format!(
                "retention {t} must have positive precision and points"
            )));
        }
    }
    for pair in sorted.windows(2) {
        let (finer, coarser) = (pair[0], pair[1]);
        if finer.seconds_per_point == coarser.seconds_per_point {
            return Err(WhisperError::InvalidRetentions(format!(
                "duplicate precision {}s",
                finer.seconds_per_point
            )));
        }
        if coarser.seconds_per_point % finer.seconds_per_point != 0 {
            return Err(WhisperError::InvalidRetentions(format!(
                "precision {}s does not evenly divide {}s",
                finer.seconds_per_point, coarser.seconds_per_point
            )));
        }
        if finer.span() >= coarser.span() {
            return Err(WhisperError::InvalidRetentions(format!(
                "{coarser} must cover a longer span than {finer}"
            )));
        }
        if finer.number_of_points < coarser.seconds_per_point / finer.seconds_per_point {
            return Err(WhisperError::InvalidRetentions(format!(
                "{finer} holds too few points to consolidate into {coarser}"
            )));
        }
    }
    Ok(sorted)
}

/// Align to the step, keeping first-seen order and the last value per slot.
fn align_points(step: u32, points: &[Point]) -> Vec<(u32, f64)> {
    let mut aligned: Vec<(u32, f64)> = Vec::with_capacity(points.len());
    let mut positions = HashMap::with_capacity(points.len());
    for p in points {
        let interval = p.timestamp - p.timestamp % step;
        if let Some(&pos) = positions.get(&interval) {
            aligned[pos] = (interval, p.value);
        } else {
            positions.insert(interval, aligned.len());
            aligned.push((interval, p.value));
        }
    }
    aligned
}

fn be_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

fn be_u64(b: &[u8]) -> u64 {
    u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

fn io_error(path: &Path, source: io::Error) -> WhisperError {
    WhisperError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn corrupt(path: &Path, reason: String) -> WhisperError {
    WhisperError::Corrupt {
        path: path.to_path_buf(),
        reason,
    }
}

fn corrupt_or_io(path: &Path, source: io::Error) -> WhisperError {
    if source.kind() == io::ErrorKind::UnexpectedEof {
        corrupt(path, "truncated".to_string())
    } else {
        io_error(path, source)
    }
}
