#![allow(clippy::cast_possible_truncation)]

use crate::error::{MemError, MemResult};
use crate::heap::{HeapDescriptor, HeapKind};
use crate::utils::page_size;
use std::env;
use std::fs;
use std::io;
use std::path::Path;

pub const PLATFORM_PATH_ENV: &str = "HWMEM_PLATFORM_PATH";

const DEFAULT_CACHE_LINE: u32 = 64;
const DEFAULT_SMALL_ALLOC_THRESHOLD: u32 = 16 * 1024;

const MIB: u64 = 1024 * 1024;

// ===============================================================================================
// Platform Description
// ===============================================================================================

/// One heap present on the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    pub kind: HeapKind,
    pub size: u64,
    /// Bus address of the first byte of the heap's storage.
    pub base_address: u64,
    /// Device-visible window for IOMMU mappings (translated heaps only).
    pub iova_base: u64,
    pub iova_size: u64,
}

impl HeapConfig {
    #[must_use]
    pub const fn new(kind: HeapKind, size: u64, base_address: u64) -> Self {
        Self {
            kind,
            size,
            base_address,
            iova_base: 0,
            iova_size: 0,
        }
    }
}

/// Everything the manager needs to know about the platform it runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformConfig {
    pub page_size: u32,
    /// Floor for every allocation's alignment, before heap minimums apply.
    pub min_alignment: u32,
    pub cache_line_size: u32,
    /// Buffers below this size default to the system heap.
    pub small_alloc_threshold: u32,
    /// Map uncached and write-combined buffers for the CPU right after allocation.
    pub eager_map: bool,
    pub heaps: Vec<HeapConfig>,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            page_size: page_size() as u32,
            min_alignment: DEFAULT_CACHE_LINE,
            cache_line_size: DEFAULT_CACHE_LINE,
            small_alloc_threshold: DEFAULT_SMALL_ALLOC_THRESHOLD,
            eager_map: true,
            heaps: Vec::new(),
        }
    }
}

impl PlatformConfig {
    /// The built-in platform: system RAM, a carveout, on-chip RAM, an IOMMU and a
    /// secured region. No camera or video-protected carveouts.
    #[must_use]
    pub fn simulated() -> Self {
        Self {
            heaps: vec![
                HeapConfig::new(HeapKind::System, 64 * MIB, 0x1_0000_0000),
                HeapConfig::new(HeapKind::CarveOut, 16 * MIB, 0x4000_0000),
                HeapConfig::new(HeapKind::OnChipFast, 256 * 1024, 0x2000_0000),
                HeapConfig {
                    kind: HeapKind::TranslatedIo,
                    size: 32 * MIB,
                    base_address: 0x8000_0000,
                    iova_base: 0x1000_0000,
                    iova_size: 256 * MIB,
                },
                HeapConfig::new(HeapKind::Secured, 8 * MIB, 0xC000_0000),
            ],
            ..Self::default()
        }
    }

    /// Loads `HWMEM_PLATFORM_PATH` if set, otherwise the simulated platform.
    ///
    /// # Errors
    /// Returns an error if the property tree named by the variable is unreadable or invalid.
    pub fn from_env() -> MemResult<Self> {
        match env::var_os(PLATFORM_PATH_ENV) {
            Some(path) => Self::from_dir(Path::new(&path)),
            None => Ok(Self::simulated()),
        }
    }

    /// Reads a property tree laid out like sysfs:
    ///
    /// ```text
    /// <root>/platform_properties
    /// <root>/heaps/0/properties
    /// <root>/heaps/1/properties
    /// ```
    ///
    /// # Errors
    /// Returns an error on I/O failure, unknown heap types or inconsistent values.
    pub fn from_dir(root: &Path) -> MemResult<Self> {
        let mut config = Self::default();

        let platform = root.join("platform_properties");
        if platform.exists() {
            config.apply_platform_properties(&fs::read_to_string(platform)?);
        }

        let heaps = parse_sub_objects(&root.join("heaps"), |path| {
            fs::read_to_string(path.join("properties"))
        })?;
        for content in heaps {
            config.heaps.push(parse_heap_properties(&content)?);
        }

        config.validate()?;
        Ok(config)
    }

    /// Applies `key value` lines; unknown keys and malformed values are ignored.
    pub fn apply_platform_properties(&mut self, content: &str) {
        for (key, val) in properties(content) {
            match key {
                "min_alignment" => self.min_alignment = val as u32,
                "cache_line_size" => self.cache_line_size = val as u32,
                "small_alloc_threshold" => self.small_alloc_threshold = val as u32,
                "eager_map" => self.eager_map = val != 0,
                _ => {}
            }
        }
    }

    /// # Errors
    /// Returns `BadValue` for non-power-of-two granularities, duplicate heaps, or a
    /// translated heap without an IOVA window.
    pub fn validate(&self) -> MemResult<()> {
        for (name, val) in [
            ("page_size", self.page_size),
            ("min_alignment", self.min_alignment),
            ("cache_line_size", self.cache_line_size),
        ] {
            if !val.is_power_of_two() {
                return Err(MemError::BadValue(format!(
                    "{name} {val} is not a power of two"
                )));
            }
        }

        for (idx, heap) in self.heaps.iter().enumerate() {
            if self.heaps[..idx].iter().any(|h| h.kind == heap.kind) {
                return Err(MemError::BadValue(format!(
                    "heap {} described twice",
                    heap.kind
                )));
            }
            if heap.size == 0 {
                return Err(MemError::BadValue(format!("heap {} has no storage", heap.kind)));
            }
            if heap.kind == HeapKind::TranslatedIo && heap.iova_size == 0 {
                return Err(MemError::BadValue("IOMMU heap without IOVA window".to_string()));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn heap(&self, kind: HeapKind) -> Option<&HeapConfig> {
        self.heaps.iter().find(|h| h.kind == kind)
    }

    #[must_use]
    pub fn has_heap(&self, kind: HeapKind) -> bool {
        self.heap(kind).is_some()
    }

    #[must_use]
    pub fn descriptor(&self, kind: HeapKind) -> HeapDescriptor {
        HeapDescriptor::for_kind(kind, self.page_size, self.cache_line_size)
    }
}

// ===============================================================================================
// Parsing
// ===============================================================================================

/// Parses one heap's `properties` file.
///
/// # Errors
/// Returns `BadValue` if `heap_type` is missing or names no known heap.
pub fn parse_heap_properties(content: &str) -> MemResult<HeapConfig> {
    let mut heap_type = None;
    let mut heap = HeapConfig::new(HeapKind::System, 0, 0);

    for (key, val) in properties(content) {
        match key {
            "heap_type" => heap_type = Some(val),
            "size_in_bytes" => heap.size = val,
            "base_address" => heap.base_address = val,
            "iova_base" => heap.iova_base = val,
            "iova_size" => heap.iova_size = val,
            _ => {}
        }
    }

    let raw = heap_type.ok_or_else(|| MemError::BadValue("heap without heap_type".to_string()))?;
    heap.kind = u32::try_from(raw)
        .ok()
        .and_then(HeapKind::from_raw)
        .ok_or_else(|| MemError::BadValue(format!("unknown heap_type {raw}")))?;
    Ok(heap)
}

/// `key value` pairs whose value parses as a number (decimal or `0x` hex).
fn properties(content: &str) -> impl Iterator<Item = (&str, u64)> {
    content.lines().filter_map(|line| {
        let mut parts = line.split_whitespace();
        let key = parts.next()?;
        let val = parse_num(parts.next()?)?;
        Some((key, val))
    })
}

fn parse_num(s: &str) -> Option<u64> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

/// Parses every numbered entry of `dir` in index order.
fn parse_sub_objects<T, F>(dir: &Path, parse_func: F) -> io::Result<Vec<T>>
where
    F: Fn(&Path) -> io::Result<T>,
{
    let mut results = Vec::new();
    if !dir.exists() {
        return Ok(results);
    }

    let mut indexed: Vec<_> = fs::read_dir(dir)?
        .filter_map(Result::ok)
        .filter_map(|e| {
            let idx = e.file_name().to_str()?.parse::<u32>().ok()?;
            Some((idx, e.path()))
        })
        .collect();
    indexed.sort_by_key(|(idx, _)| *idx);

    for (_, path) in indexed {
        results.push(parse_func(&path)?);
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> std::path::PathBuf {
        let dir = env::temp_dir().join(format!("hwmem-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn simulated_platform_lacks_protected_carveouts() {
        let config = PlatformConfig::simulated();
        config.validate().unwrap();
        assert!(config.has_heap(HeapKind::CarveOut));
        assert!(config.has_heap(HeapKind::TranslatedIo));
        assert!(!config.has_heap(HeapKind::CameraReserved));
        assert!(!config.has_heap(HeapKind::VideoProtected));
    }

    #[test]
    fn heap_properties_accept_hex_and_decimal() {
        let heap = parse_heap_properties(
            "heap_type 4\nsize_in_bytes 1048576\nbase_address 0x80000000\n\
             iova_base 0x10000000\niova_size 0x1000000\nvendor_note foo\n",
        )
        .unwrap();
        assert_eq!(heap.kind, HeapKind::TranslatedIo);
        assert_eq!(heap.size, 1 << 20);
        assert_eq!(heap.base_address, 0x8000_0000);
        assert_eq!(heap.iova_size, 0x100_0000);
    }

    #[test]
    fn unknown_heap_type_is_rejected() {
        assert!(matches!(
            parse_heap_properties("heap_type 42\nsize_in_bytes 4096\n"),
            Err(MemError::BadValue(_))
        ));
        assert!(parse_heap_properties("size_in_bytes 4096\n").is_err());
    }

    #[test]
    fn malformed_platform_values_keep_defaults() {
        let mut config = PlatformConfig::default();
        config.apply_platform_properties("cache_line_size banana\neager_map 0\n");
        assert_eq!(config.cache_line_size, DEFAULT_CACHE_LINE);
        assert!(!config.eager_map);
    }

    #[test]
    fn loads_tree_in_index_order() {
        let root = scratch_dir("tree");
        fs::write(root.join("platform_properties"), "cache_line_size 128\n").unwrap();
        for (idx, body) in [
            (10, "heap_type 1\nsize_in_bytes 65536\nbase_address 0x40000000\n"),
            (2, "heap_type 0\nsize_in_bytes 1048576\n"),
        ] {
            let dir = root.join("heaps").join(idx.to_string());
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("properties"), body).unwrap();
        }

        let config = PlatformConfig::from_dir(&root).unwrap();
        assert_eq!(config.cache_line_size, 128);
        let kinds: Vec<_> = config.heaps.iter().map(|h| h.kind).collect();
        assert_eq!(kinds, [HeapKind::System, HeapKind::CarveOut]);

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn duplicate_heaps_fail_validation() {
        let mut config = PlatformConfig::simulated();
        config.heaps.push(HeapConfig::new(HeapKind::System, 4096, 0));
        assert!(config.validate().is_err());
    }
}
