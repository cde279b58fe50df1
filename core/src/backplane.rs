//! Memory-mapped signal backplane
//!
//! A backplane segment is a POSIX shared memory object with four regions:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ Header (64 bytes)                                        │
//! │   magic: u32 ("HERM"), version: u32, frame: u64,         │
//! │   time_ns: u64, signal_count: u32, reserved              │
//! ├──────────────────────────────────────────────────────────┤
//! │ Directory: signal_count × 16-byte entries                │
//! │   (name_offset: u32, data_offset: u32, padding)          │
//! ├──────────────────────────────────────────────────────────┤
//! │ String table: NUL-terminated UTF-8 signal names          │
//! ├──────────────────────────────────────────────────────────┤
//! │ Data region (64-byte aligned): signal_count × 8 bytes    │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! All integers are little-endian. Time is stored as integer nanoseconds;
//! the seconds accessors are conveniences that convert through the
//! authoritative `time_ns` field.
//!
//! Individual 8-byte accesses are word-sized and assumed torn-free on the
//! target architectures. There is no cross-signal atomicity; the scheduler
//! keeps a single-writer window per signal and readers must tolerate
//! mid-frame snapshots.
use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::fs::File;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::anyhow;
use memmap2::MmapMut;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;

use crate::error::{ResultExt, SystemError, TypedResult};
use crate::problem;
use crate::signal::SignalDescriptor;
use crate::NANOS_PER_SECOND;

/// "HERM" in ASCII
pub const BACKPLANE_MAGIC: u32 = 0x4845_524D;
/// v3: time_ns (nanoseconds) as u64
pub const BACKPLANE_VERSION: u32 = 3;
/// Fixed header size in bytes
pub const HEADER_SIZE: usize = 64;
/// Size of one directory entry in bytes
pub const DIR_ENTRY_SIZE: usize = 16;

const MAGIC_OFFSET: usize = 0;
const VERSION_OFFSET: usize = 4;
const FRAME_OFFSET: usize = 8;
const TIME_NS_OFFSET: usize = 16;
const COUNT_OFFSET: usize = 24;

const fn align64(n: usize) -> usize {
    (n + 63) & !63
}

/// Fully initialized segment image plus the derived lookup tables
#[derive(Debug)]
struct SegmentImage {
    bytes: Vec<u8>,
    names: Vec<String>,
    offsets: HashMap<String, usize>,
}

/// Builds the byte image of a fresh segment from the signal set.
/// Duplicate qualified names are rejected.
fn build_segment(signals: &[SignalDescriptor]) -> TypedResult<SegmentImage> {
    let mut string_table = Vec::new();
    let mut entries = Vec::with_capacity(signals.len());
    let mut names = Vec::with_capacity(signals.len());

    for (i, sig) in signals.iter().enumerate() {
        if names.contains(&sig.name) {
            return Err(problem!(Config, "Duplicate signal name: {}", sig.name));
        }
        entries.push((string_table.len() as u32, (i * 8) as u32));
        string_table.extend_from_slice(sig.name.as_bytes());
        string_table.push(0);
        names.push(sig.name.clone());
    }

    let directory_size = signals.len() * DIR_ENTRY_SIZE;
    let data_start = align64(HEADER_SIZE + directory_size + string_table.len());
    let total_size = data_start + signals.len() * 8;

    let mut bytes = vec![0u8; total_size];
    bytes[MAGIC_OFFSET..MAGIC_OFFSET + 4].copy_from_slice(&BACKPLANE_MAGIC.to_le_bytes());
    bytes[VERSION_OFFSET..VERSION_OFFSET + 4].copy_from_slice(&BACKPLANE_VERSION.to_le_bytes());
    bytes[COUNT_OFFSET..COUNT_OFFSET + 4].copy_from_slice(&(signals.len() as u32).to_le_bytes());

    for (i, (name_off, data_off)) in entries.iter().enumerate() {
        let at = HEADER_SIZE + i * DIR_ENTRY_SIZE;
        bytes[at..at + 4].copy_from_slice(&name_off.to_le_bytes());
        bytes[at + 4..at + 8].copy_from_slice(&data_off.to_le_bytes());
    }

    let strings_at = HEADER_SIZE + directory_size;
    bytes[strings_at..strings_at + string_table.len()].copy_from_slice(&string_table);

    let offsets = names
        .iter()
        .enumerate()
        .map(|(i, n)| (n.clone(), data_start + i * 8))
        .collect();

    Ok(SegmentImage {
        bytes,
        names,
        offsets,
    })
}

/// Reconstructs the name → absolute-offset map from an existing segment,
/// validating the layout invariants on the way
fn parse_segment(buf: &[u8]) -> TypedResult<(Vec<String>, HashMap<String, usize>)> {
    if buf.len() < HEADER_SIZE {
        return Err(problem!(Resource, "Segment shorter than header: {}", buf.len()));
    }

    let read_u32 = |at: usize| u32::from_le_bytes(buf[at..at + 4].try_into().unwrap());

    let magic = read_u32(MAGIC_OFFSET);
    if magic != BACKPLANE_MAGIC {
        return Err(problem!(Resource, "Invalid segment magic: {magic:#x}"));
    }
    let version = read_u32(VERSION_OFFSET);
    if version != BACKPLANE_VERSION {
        return Err(problem!(
            Resource,
            "Unsupported segment version: {version} (expected {BACKPLANE_VERSION})"
        ));
    }

    let count = read_u32(COUNT_OFFSET) as usize;
    let strings_at = HEADER_SIZE + count * DIR_ENTRY_SIZE;
    if strings_at > buf.len() {
        return Err(problem!(Resource, "Directory exceeds segment size"));
    }

    // First pass finds the end of the string table, which determines where
    // the 64-byte aligned data region starts
    let mut entries = Vec::with_capacity(count);
    let mut strings_end = strings_at;
    for i in 0..count {
        let at = HEADER_SIZE + i * DIR_ENTRY_SIZE;
        let name_off = read_u32(at) as usize;
        let data_off = read_u32(at + 4) as usize;

        let name_at = strings_at + name_off;
        if name_at >= buf.len() {
            return Err(problem!(Resource, "Name offset {name_off} out of bounds"));
        }
        let nul = buf[name_at..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| problem!(Resource, "Unterminated signal name at {name_at}"))?;
        let name = std::str::from_utf8(&buf[name_at..name_at + nul])
            .map_err(|e| problem!(Resource, "Signal name is not UTF-8: {e}"))?
            .to_string();

        strings_end = strings_end.max(name_at + nul + 1);
        entries.push((name, data_off));
    }

    let data_start = align64(strings_end);
    let mut names = Vec::with_capacity(count);
    let mut offsets = HashMap::with_capacity(count);
    for (name, data_off) in entries {
        if data_off % 8 != 0 || data_start + data_off + 8 > buf.len() {
            return Err(problem!(
                Resource,
                "Signal {name} has invalid data offset {data_off}"
            ));
        }
        if offsets.insert(name.clone(), data_start + data_off).is_some() {
            return Err(problem!(Resource, "Duplicate signal in directory: {name}"));
        }
        names.push(name);
    }

    Ok((names, offsets))
}

/// A mapped backplane segment
///
/// The creator owns the segment name and is responsible for [`Backplane::destroy`];
/// attachers release their mapping by dropping the value. All accessors take
/// `&self`: the segment is cross-process shared memory, so Rust aliasing
/// cannot govern it and the single-writer discipline is upheld by convention.
pub struct Backplane {
    name: String,
    mmap: UnsafeCell<MmapMut>,
    names: Vec<String>,
    offsets: HashMap<String, usize>,
    owner: bool,
    unlinked: AtomicBool,
}

// Word-sized volatile accesses only; tearing is excluded by the layout
// (every value is 8-byte sized) and cross-signal races by the single-writer
// windows of the scheduler.
unsafe impl Send for Backplane {}
unsafe impl Sync for Backplane {}

impl Backplane {
    /// Atomically creates and initializes a new segment.
    /// Fails if a segment of this name already exists.
    pub fn create(name: &str, signals: &[SignalDescriptor]) -> TypedResult<Self> {
        let image = build_segment(signals)?;

        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::from_bits_truncate(0o600),
        )
        .map_err(|e| problem!(Resource, "Creating segment {name} failed: {e}"))?;

        let init = || -> TypedResult<MmapMut> {
            ftruncate(&fd, image.bytes.len() as i64).typ(SystemError::Resource)?;
            let file = File::from(fd.try_clone().typ(SystemError::Resource)?);
            let mut mmap = unsafe { MmapMut::map_mut(&file) }.typ(SystemError::Resource)?;
            mmap.copy_from_slice(&image.bytes);
            Ok(mmap)
        };
        let mmap = match init() {
            Ok(mmap) => mmap,
            Err(e) => {
                // Partial construction: do not leave the name behind
                let _ = shm_unlink(name);
                return Err(e);
            }
        };

        debug!("Created segment {name} ({} signals)", signals.len());
        Ok(Self {
            name: name.to_string(),
            mmap: UnsafeCell::new(mmap),
            names: image.names,
            offsets: image.offsets,
            owner: true,
            unlinked: AtomicBool::new(false),
        })
    }

    /// Opens an existing segment and rebuilds the signal map from its
    /// directory. Rejects foreign or cross-version segments.
    pub fn attach(name: &str) -> TypedResult<Self> {
        let fd = shm_open(name, OFlag::O_RDWR, Mode::empty())
            .map_err(|e| problem!(Resource, "Attaching segment {name} failed: {e}"))?;
        let file = File::from(fd);
        let mmap = unsafe { MmapMut::map_mut(&file) }.typ(SystemError::Resource)?;

        let (names, offsets) = parse_segment(&mmap)?;
        trace!("Attached segment {name} ({} signals)", names.len());
        Ok(Self {
            name: name.to_string(),
            mmap: UnsafeCell::new(mmap),
            names,
            offsets,
            owner: false,
            unlinked: AtomicBool::new(false),
        })
    }

    /// Segment name (leading-slash POSIX form)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// All qualified signal names in layout (insertion) order
    pub fn signal_names(&self) -> &[String] {
        &self.names
    }

    pub fn signal_count(&self) -> usize {
        self.names.len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.offsets.contains_key(name)
    }

    #[inline]
    fn load_u64(&self, at: usize) -> u64 {
        let base = unsafe { (*self.mmap.get()).as_mut_ptr() };
        u64::from_le(unsafe { (base.add(at) as *const u64).read_volatile() })
    }

    #[inline]
    fn store_u64(&self, at: usize, value: u64) {
        let base = unsafe { (*self.mmap.get()).as_mut_ptr() };
        unsafe { (base.add(at) as *mut u64).write_volatile(value.to_le()) };
    }

    fn data_offset(&self, name: &str) -> TypedResult<usize> {
        self.offsets
            .get(name)
            .copied()
            .ok_or_else(|| problem!(SignalNotFound, "Signal not found: {name}"))
    }

    /// Reads a signal value
    pub fn get_signal(&self, name: &str) -> TypedResult<f64> {
        Ok(f64::from_bits(self.load_u64(self.data_offset(name)?)))
    }

    /// Writes a signal value
    pub fn set_signal(&self, name: &str, value: f64) -> TypedResult<()> {
        self.store_u64(self.data_offset(name)?, value.to_bits());
        Ok(())
    }

    pub fn frame(&self) -> u64 {
        self.load_u64(FRAME_OFFSET)
    }

    pub fn set_frame(&self, frame: u64) {
        self.store_u64(FRAME_OFFSET, frame);
    }

    /// Authoritative simulation time in integer nanoseconds
    pub fn time_ns(&self) -> u64 {
        self.load_u64(TIME_NS_OFFSET)
    }

    pub fn set_time_ns(&self, time_ns: u64) {
        self.store_u64(TIME_NS_OFFSET, time_ns);
    }

    /// Simulation time in seconds, derived from [`Backplane::time_ns`]
    pub fn time(&self) -> f64 {
        self.time_ns() as f64 / NANOS_PER_SECOND as f64
    }

    /// Sets the simulation time from seconds, converting through integer
    /// nanoseconds
    pub fn set_time(&self, time: f64) {
        self.set_time_ns((time * NANOS_PER_SECOND as f64).round() as u64);
    }

    /// Unlinks the segment name. Idempotent; the local mapping is released
    /// when the value is dropped.
    pub fn destroy(&self) -> TypedResult<()> {
        if self.unlinked.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match shm_unlink(self.name.as_str()) {
            Ok(()) | Err(Errno::ENOENT) => Ok(()),
            Err(e) => Err(anyhow!("Unlinking segment {} failed: {e}", self.name))
                .typ(SystemError::Resource),
        }
    }
}

impl Drop for Backplane {
    fn drop(&mut self) {
        if self.owner && !self.unlinked.load(Ordering::SeqCst) {
            let _ = shm_unlink(self.name.as_str());
        }
    }
}

impl std::fmt::Debug for Backplane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backplane")
            .field("name", &self.name)
            .field("signals", &self.names.len())
            .field("owner", &self.owner)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    fn descriptors(names: &[&str]) -> Vec<SignalDescriptor> {
        names.iter().map(|n| SignalDescriptor::new(*n)).collect()
    }

    fn unique_name(tag: &str) -> String {
        format!("/hermes_test_{}_{tag}", std::process::id())
    }

    #[test]
    fn image_layout_round_trip() {
        let sigs = descriptors(&["a.x", "a.y", "b.very_long_signal_name"]);
        let image = build_segment(&sigs).unwrap();
        let (names, offsets) = parse_segment(&image.bytes).unwrap();

        assert_eq!(names, vec!["a.x", "a.y", "b.very_long_signal_name"]);
        assert_eq!(offsets, image.offsets);
        for off in offsets.values() {
            assert_eq!(off % 8, 0);
        }
    }

    #[test]
    fn image_data_region_is_aligned() {
        let image = build_segment(&descriptors(&["m.s"])).unwrap();
        assert_eq!(image.offsets["m.s"] % 64, 0);
        assert_eq!(image.bytes.len(), image.offsets["m.s"] + 8);
    }

    #[test]
    fn duplicate_names_rejected() {
        let err = build_segment(&descriptors(&["m.s", "m.s"])).unwrap_err();
        assert_eq!(err.err(), SystemError::Config);
    }

    #[test]
    fn parse_rejects_bad_magic_and_version() {
        let mut image = build_segment(&descriptors(&["m.s"])).unwrap().bytes;
        image[0] ^= 0xff;
        assert_eq!(
            parse_segment(&image).unwrap_err().err(),
            SystemError::Resource
        );

        let mut image = build_segment(&descriptors(&["m.s"])).unwrap().bytes;
        image[VERSION_OFFSET] = 99;
        assert_eq!(
            parse_segment(&image).unwrap_err().err(),
            SystemError::Resource
        );
    }

    #[test]
    fn create_attach_round_trip() {
        let name = unique_name("round_trip");
        let creator = Backplane::create(&name, &descriptors(&["m.a", "m.b", "n.c"])).unwrap();
        creator.set_signal("m.b", 42.5).unwrap();

        let attached = Backplane::attach(&name).unwrap();
        assert_eq!(attached.signal_names(), creator.signal_names());
        assert_eq!(attached.get_signal("m.b").unwrap(), 42.5);

        attached.set_signal("n.c", -1.0).unwrap();
        assert_eq!(creator.get_signal("n.c").unwrap(), -1.0);

        creator.destroy().unwrap();
        creator.destroy().unwrap(); // idempotent
        assert!(Backplane::attach(&name).is_err());
    }

    #[test]
    fn create_rejects_existing_name() {
        let name = unique_name("exclusive");
        let first = Backplane::create(&name, &descriptors(&["m.a"])).unwrap();
        let second = Backplane::create(&name, &descriptors(&["m.a"]));
        assert_eq!(second.unwrap_err().err(), SystemError::Resource);
        first.destroy().unwrap();
    }

    #[test]
    fn unknown_signal_reported() {
        let name = unique_name("unknown");
        let bp = Backplane::create(&name, &descriptors(&["m.a"])).unwrap();
        let err = bp.get_signal("m.nope").unwrap_err();
        assert_eq!(err.err(), SystemError::SignalNotFound);
        bp.destroy().unwrap();
    }

    #[test]
    fn header_round_trips() {
        let name = unique_name("header");
        let bp = Backplane::create(&name, &[]).unwrap();

        bp.set_frame(7);
        bp.set_time_ns(u64::MAX);
        assert_eq!(bp.frame(), 7);
        assert_eq!(bp.time_ns(), u64::MAX);

        bp.set_time(1.5);
        assert_eq!(bp.time_ns(), 1_500_000_000);
        assert_eq!(bp.time(), 1.5);

        bp.destroy().unwrap();
    }

    #[test]
    fn signal_values_round_trip() {
        let name = unique_name("values");
        let bp = Backplane::create(&name, &descriptors(&["m.v"])).unwrap();

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..256 {
            let x = f64::from_bits(rng.gen::<u64>());
            if !x.is_finite() {
                continue;
            }
            bp.set_signal("m.v", x).unwrap();
            assert_eq!(bp.get_signal("m.v").unwrap(), x);
        }
        bp.destroy().unwrap();
    }
}
