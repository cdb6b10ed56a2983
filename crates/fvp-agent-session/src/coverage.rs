//! Coverage extraction from an instrumented guest.
//!
//! The guest runtime calls `coverage_dump` once per object file with a
//! `coverage_pack` descriptor of three little-endian words: buffer start,
//! buffer end and a pointer to the NUL-terminated `.gcda` file name. It
//! returns from `collect_coverage` when every buffer has been offered. The
//! extractor stops the CPU inside both functions and writes each buffer to
//! its file on the host.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use fvp_agent_core::{Error, Result};

use crate::bridge::DebugModel;
use crate::symbols::{ReadelfSymbols, SymbolSource};

/// Descriptor of the buffer being dumped.
pub const COVERAGE_SYMBOL: &str = "coverage_pack";
/// Function invoked per dumped buffer.
pub const DUMP_SYMBOL: &str = "coverage_dump";
/// Function that returns once every buffer was dumped.
pub const COLLECT_SYMBOL: &str = "collect_coverage";

/// Breakpoint offset into `coverage_dump`, past its prologue.
pub const DUMP_BREAK_OFFSET: u64 = 57;
/// Breakpoint offset into `collect_coverage`, at its return path.
pub const COLLECT_BREAK_OFFSET: u64 = 43;

const PC_REGISTER: &str = "PC";
const MAX_NAME_LEN: usize = 4096;

/// Aggregates dumped coverage files.
pub trait CoverageCollector: Send + Sync {
    /// Aggregate the `.gcda` files under `work_dir` into a report named
    /// after the image.
    fn collect(&self, work_dir: &Path, name: &str) -> Result<()>;
}

/// [`CoverageCollector`] running `lcov`, writing `BUILD/<name>.info`.
#[derive(Debug, Clone)]
pub struct LcovCollector {
    program: String,
}

impl LcovCollector {
    /// Use the given `lcov` executable.
    pub fn new<S: Into<String>>(program: S) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for LcovCollector {
    fn default() -> Self {
        Self::new("lcov")
    }
}

impl CoverageCollector for LcovCollector {
    fn collect(&self, work_dir: &Path, name: &str) -> Result<()> {
        fs::create_dir_all(work_dir.join("BUILD"))?;
        let report = format!("BUILD/{name}.info");

        let status = match Command::new(&self.program)
            .args(["-c", "-d", ".", "--no-external", "-o", &report])
            .current_dir(work_dir)
            .status()
        {
            Ok(status) => status,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::ToolchainNotInstalled {
                    detail: format!("'{}' not found", self.program),
                    hint: format!("Make sure you have {} in PATH", self.program),
                })
            }
            Err(e) => return Err(Error::Io(e)),
        };

        if status.success() {
            info!(report, "Coverage report written");
            Ok(())
        } else {
            Err(Error::Coverage(format!("{} exited with {status}", self.program)))
        }
    }
}

/// Delete every `.gcda` file below `root`. Returns how many were removed.
pub fn remove_gcda(root: &Path) -> Result<usize> {
    let mut removed = 0;
    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        let path = entry.path();
        if entry.file_type().is_file() && path.extension().is_some_and(|ext| ext == "gcda") {
            fs::remove_file(path)?;
            removed += 1;
        }
    }
    debug!(root = %root.display(), removed, "Removed stale coverage files");
    Ok(removed)
}

/// Outcome of one extraction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoverageReport {
    /// Files written, in dump order
    pub files: Vec<PathBuf>,
    /// Whether the guest reached the end of `collect_coverage`
    pub completed: bool,
}

/// Drives the guest through its coverage dump loop.
#[derive(Clone)]
pub struct CoverageExtractor {
    symbols: Arc<dyn SymbolSource>,
    collector: Arc<dyn CoverageCollector>,
    work_dir: PathBuf,
    breakpoint_timeout: Duration,
}

impl std::fmt::Debug for CoverageExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoverageExtractor")
            .field("work_dir", &self.work_dir)
            .field("breakpoint_timeout", &self.breakpoint_timeout)
            .finish_non_exhaustive()
    }
}

impl CoverageExtractor {
    /// Create an extractor.
    pub fn new(
        symbols: Arc<dyn SymbolSource>,
        collector: Arc<dyn CoverageCollector>,
        work_dir: PathBuf,
        breakpoint_timeout: Duration,
    ) -> Self {
        Self {
            symbols,
            collector,
            work_dir,
            breakpoint_timeout,
        }
    }

    /// Extractor using `arm-none-eabi-readelf` and `lcov` in `work_dir`.
    pub fn with_host_tools(work_dir: PathBuf, breakpoint_timeout: Duration) -> Self {
        Self::new(
            Arc::new(ReadelfSymbols::default()),
            Arc::new(LcovCollector::default()),
            work_dir,
            breakpoint_timeout,
        )
    }

    /// Directory dumps are written relative to.
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Run the dump loop on a model that has `image` loaded and is stopped
    /// or running towards `collect_coverage`.
    pub fn extract(&self, model: &mut dyn DebugModel, image: &Path) -> Result<CoverageReport> {
        let table = self.symbols.symbols(image)?;
        let pack = table.resolve(COVERAGE_SYMBOL)?;
        let dump = table.resolve(DUMP_SYMBOL)?;
        let collect = table.resolve(COLLECT_SYMBOL)?;

        let cpu = model.cpu(0)?;
        let dump_bpt = cpu.add_bpt_prog(dump + DUMP_BREAK_OFFSET)?;
        let collect_bpt = cpu.add_bpt_prog(collect + COLLECT_BREAK_OFFSET)?;
        debug!(
            dump = format_args!("{:#x}", dump_bpt.address),
            collect = format_args!("{:#x}", collect_bpt.address),
            "Coverage breakpoints installed"
        );

        remove_gcda(&self.work_dir)?;

        let mut report = CoverageReport::default();
        loop {
            if let Err(e) = model.run(true, self.breakpoint_timeout) {
                if matches!(e, Error::Timeout { .. }) {
                    warn!("Coverage breakpoint not reached, stopping CPU");
                    if let Err(stop) = model.stop() {
                        warn!(error = %stop, "Failed to stop CPU");
                    }
                }
                return Err(e);
            }

            let cpu = model.cpu(0)?;
            let pc = cpu.read_register(PC_REGISTER)?;
            if same_address(pc, dump_bpt.address) {
                let descriptor = cpu.read_memory(pack, 4, 3)?;
                let [start, end, name_ptr] = decode_words(&descriptor)?;
                if end < start {
                    return Err(Error::Coverage(format!(
                        "coverage buffer ends before it starts ({start:#x}..{end:#x})"
                    )));
                }
                let name = read_c_string(cpu, name_ptr)?;
                let data = cpu.read_memory(start, 1, (end - start) as usize)?;
                let path = self.write_dump(&name, &data)?;
                report.files.push(path);
            } else if same_address(pc, collect_bpt.address) {
                report.completed = true;
                break;
            } else {
                warn!(pc = format_args!("{pc:#x}"), "CPU stopped outside coverage breakpoints");
                break;
            }
        }

        let name = image
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "coverage".to_string());
        self.collector.collect(&self.work_dir, &name)?;

        info!(
            files = report.files.len(),
            completed = report.completed,
            "Coverage extraction finished"
        );
        Ok(report)
    }

    fn write_dump(&self, name: &str, data: &[u8]) -> Result<PathBuf> {
        let path = self.work_dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, data)?;
        debug!(path = %path.display(), bytes = data.len(), "Coverage buffer written");
        Ok(path)
    }
}

/// Compare addresses ignoring the Thumb bit.
fn same_address(a: u64, b: u64) -> bool {
    a & !1 == b & !1
}

fn decode_words(bytes: &[u8]) -> Result<[u64; 3]> {
    if bytes.len() < 12 {
        return Err(Error::Coverage(format!(
            "coverage descriptor too short: {} bytes",
            bytes.len()
        )));
    }
    let word = |i: usize| {
        u64::from(u32::from_le_bytes([
            bytes[i * 4],
            bytes[i * 4 + 1],
            bytes[i * 4 + 2],
            bytes[i * 4 + 3],
        ]))
    };
    Ok([word(0), word(1), word(2)])
}

/// Read a NUL-terminated file name, trimming trailing whitespace and
/// control characters.
fn read_c_string(cpu: &mut dyn crate::bridge::DebugTarget, address: u64) -> Result<String> {
    let mut raw = Vec::new();
    while raw.len() < MAX_NAME_LEN {
        let byte = cpu.read_memory(address + raw.len() as u64, 1, 1)?;
        match byte.first() {
            Some(0) | None => break,
            Some(&b) => raw.push(b),
        }
    }

    let name = String::from_utf8_lossy(&raw);
    let name = name.trim_end_matches(|c: char| c.is_whitespace() || c.is_control());
    if name.is_empty() {
        return Err(Error::Coverage(format!(
            "empty coverage file name at {address:#x}"
        )));
    }
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_words_little_endian() {
        let bytes = [
            0x00, 0x10, 0x00, 0x20, // start
            0x40, 0x10, 0x00, 0x20, // end
            0xf0, 0x00, 0x00, 0x20, // name
        ];
        assert_eq!(
            decode_words(&bytes).unwrap(),
            [0x2000_1000, 0x2000_1040, 0x2000_00f0]
        );
        assert!(decode_words(&bytes[..8]).is_err());
    }

    #[test]
    fn test_same_address_ignores_thumb_bit() {
        assert!(same_address(0xc21f, 0xc21e));
        assert!(!same_address(0xc220, 0xc21e));
    }

    #[test]
    fn test_remove_gcda_recurses() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("BUILD").join("obj");
        fs::create_dir_all(&nested).unwrap();
        fs::write(dir.path().join("main.gcda"), b"x").unwrap();
        fs::write(nested.join("util.gcda"), b"x").unwrap();
        fs::write(nested.join("util.gcno"), b"x").unwrap();

        assert_eq!(remove_gcda(dir.path()).unwrap(), 2);
        assert!(nested.join("util.gcno").exists());
        assert!(!nested.join("util.gcda").exists());
    }

    #[test]
    fn test_missing_lcov_is_toolchain_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = LcovCollector::new("definitely-not-lcov")
            .collect(dir.path(), "app")
            .unwrap_err();
        assert!(matches!(err, Error::ToolchainNotInstalled { .. }));
    }
}
