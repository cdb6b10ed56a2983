//! ELF symbol lookup through `readelf -sW`.

use std::io;
use std::path::Path;
use std::process::Command;

use tracing::debug;

use fvp_agent_core::{Error, Result};

/// Symbol reader used for Arm images.
pub const DEFAULT_READELF: &str = "arm-none-eabi-readelf";

/// One symbol table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    /// Value column, as printed (hex, no prefix)
    pub address: String,
    /// Symbol name
    pub name: String,
}

/// Symbols of one image, in dump order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolTable {
    entries: Vec<Symbol>,
}

impl SymbolTable {
    /// Parse `readelf -sW` output.
    ///
    /// ```text
    ///    Num:    Value  Size Type    Bind   Vis      Ndx Name
    ///     24: 0002f45a     0 NOTYPE  LOCAL  DEFAULT    2 init_bss
    /// ```
    ///
    /// Rows without a name and header lines are skipped.
    pub fn parse_readelf(output: &str) -> Self {
        let entries = output
            .lines()
            .filter_map(|line| {
                let fields: Vec<&str> = line.split_whitespace().collect();
                let is_row = fields.first().is_some_and(|f| {
                    f.ends_with(':') && f[..f.len() - 1].chars().all(|c| c.is_ascii_digit())
                });
                if !is_row || fields.len() < 8 {
                    return None;
                }
                Some(Symbol {
                    address: fields[1].to_string(),
                    name: fields[7].to_string(),
                })
            })
            .collect();
        Self { entries }
    }

    /// Address column of the first symbol with this name.
    pub fn address_of(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.address.as_str())
    }

    /// Numeric address of a symbol.
    pub fn resolve(&self, name: &str) -> Result<u64> {
        let address = self
            .address_of(name)
            .ok_or_else(|| Error::SymbolNotFound(name.to_string()))?;
        u64::from_str_radix(address.trim_start_matches("0x"), 16).map_err(|_| {
            Error::Coverage(format!("symbol '{name}' has malformed address '{address}'"))
        })
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in dump order.
    pub fn iter(&self) -> impl Iterator<Item = &Symbol> {
        self.entries.iter()
    }
}

/// Produces the symbol table of an image.
pub trait SymbolSource: Send + Sync {
    /// Read the symbols of `image`.
    fn symbols(&self, image: &Path) -> Result<SymbolTable>;
}

/// [`SymbolSource`] running an external `readelf`.
#[derive(Debug, Clone)]
pub struct ReadelfSymbols {
    program: String,
}

impl ReadelfSymbols {
    /// Use the given `readelf` executable.
    pub fn new<S: Into<String>>(program: S) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for ReadelfSymbols {
    fn default() -> Self {
        Self::new(DEFAULT_READELF)
    }
}

impl SymbolSource for ReadelfSymbols {
    fn symbols(&self, image: &Path) -> Result<SymbolTable> {
        let output = match Command::new(&self.program).arg("-sW").arg(image).output() {
            Ok(output) => output,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::ToolchainNotInstalled {
                    detail: format!("'{}' not found", self.program),
                    hint: format!("Make sure you have {} in PATH", self.program),
                })
            }
            Err(e) => return Err(Error::Io(e)),
        };

        if !output.status.success() {
            return Err(Error::Coverage(format!(
                "{} failed on {}: {}",
                self.program,
                image.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let table = SymbolTable::parse_readelf(&String::from_utf8_lossy(&output.stdout));
        debug!(image = %image.display(), symbols = table.len(), "Read symbol table");
        Ok(table)
    }
}
