//! Model catalog listing.

use std::fmt;
use std::path::PathBuf;

use fvp_agent_core::FvpSettings;
use fvp_agent_process::locate_iris;

/// Whether a catalog entry can be launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    /// Binary and config file both exist
    Yes,
    /// Model binary missing
    NoModelBinary,
    /// Config file missing
    NoConfigFile,
}

impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Availability::Yes => write!(f, "YES"),
            Availability::NoModelBinary => write!(f, "NO  'MODEL BINARY' NOT EXIST"),
            Availability::NoConfigFile => write!(f, "NO  'CONFIG FILE' NOT EXIST"),
        }
    }
}

/// Outcome of launching one entry during a self test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelfTestResult {
    /// Launched and announced its ports
    Passed,
    /// Launch failed or timed out
    Failed,
    /// Not launchable
    Skipped,
}

impl fmt::Display for SelfTestResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelfTestResult::Passed => write!(f, "PASSED"),
            SelfTestResult::Failed => write!(f, "FAILED"),
            SelfTestResult::Skipped => write!(f, "SKIPPED"),
        }
    }
}

/// One model/config pair of the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    /// Model name
    pub model: String,
    /// Model binary, if declared
    pub binary: Option<PathBuf>,
    /// Config name
    pub config_name: String,
    /// Config file as written in the settings
    pub config_file: String,
    /// Launchability
    pub availability: Availability,
    /// Self test outcome, when one was run
    pub self_test: Option<SelfTestResult>,
}

/// Every model/config pair, sorted by model then config name.
pub fn catalog(settings: &FvpSettings) -> Vec<CatalogEntry> {
    let mut entries = Vec::new();
    for (model, configs) in settings.all_configs() {
        let binary = settings.model_binary(&model);
        let binary_exists = binary.as_ref().is_some_and(|b| b.exists());
        for (config_name, config_file) in configs {
            let availability = if !binary_exists {
                Availability::NoModelBinary
            } else if settings.check_config_exist(&config_file) {
                Availability::Yes
            } else {
                Availability::NoConfigFile
            };
            entries.push(CatalogEntry {
                model: model.clone(),
                binary: binary.clone(),
                config_name,
                config_file,
                availability,
                self_test: None,
            });
        }
    }
    entries
}

/// Render entries as a boxed table. A `SELF TEST` column is added when any
/// entry carries a self test outcome.
pub fn render_table(entries: &[CatalogEntry]) -> String {
    let with_self_test = entries.iter().any(|e| e.self_test.is_some());
    let mut headers = vec![
        "MODEL NAME",
        "MODEL BINARY FULL PATH",
        "CONFIG NAME",
        "CONFIG FILE",
        "AVAILABILITY",
    ];
    if with_self_test {
        headers.push("SELF TEST");
    }

    let mut rows: Vec<Vec<String>> = Vec::with_capacity(entries.len());
    let mut previous_model: Option<&str> = None;
    for entry in entries {
        let first_of_model = previous_model != Some(entry.model.as_str());
        previous_model = Some(&entry.model);

        let (model, binary) = if first_of_model {
            (
                entry.model.clone(),
                entry
                    .binary
                    .as_ref()
                    .map(|b| b.display().to_string())
                    .unwrap_or_default(),
            )
        } else {
            (String::new(), String::new())
        };
        let mut row = vec![
            model,
            binary,
            entry.config_name.clone(),
            entry.config_file.clone(),
            entry.availability.to_string(),
        ];
        if with_self_test {
            row.push(entry.self_test.map(|r| r.to_string()).unwrap_or_default());
        }
        rows.push(row);
    }

    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let rule = widths.iter().fold(String::from("+"), |mut line, w| {
        line.push_str(&"-".repeat(w + 2));
        line.push('+');
        line
    });
    let format_row = |cells: &[String]| {
        let mut line = String::from("|");
        for (cell, width) in cells.iter().zip(&widths) {
            line.push_str(&format!(" {cell:<width$} |"));
        }
        line
    };

    let header_cells: Vec<String> = headers.iter().map(|h| h.to_string()).collect();
    let mut out = vec![rule.clone(), format_row(&header_cells), rule.clone()];
    for row in &rows {
        out.push(format_row(row));
        out.push(rule.clone());
    }
    out.join("\n")
}

/// Check the debug bridge library and describe the result in one line.
pub fn iris_check(settings: &FvpSettings) -> (bool, String) {
    match locate_iris(settings) {
        Ok(path) => (
            true,
            format!("Import IRIS Test ... PASSED ({})", path.display()),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "Iris library not found");
            (false, "Import IRIS Test ... FAILED".to_string())
        }
    }
}

/// Catalog table plus the bridge library check, as printed by the binary.
#[derive(Debug, Clone)]
pub struct Report {
    /// Catalog rows
    pub entries: Vec<CatalogEntry>,
    /// Whether the bridge library was found
    pub iris_found: bool,
    /// One-line bridge library check result
    pub iris_line: String,
}

impl Report {
    /// Build a report from catalog rows.
    pub fn new(settings: &FvpSettings, entries: Vec<CatalogEntry>) -> Self {
        let (iris_found, iris_line) = iris_check(settings);
        Self {
            entries,
            iris_found,
            iris_line,
        }
    }

    /// The bridge library was found and no self test failed.
    pub fn success(&self) -> bool {
        self.iris_found
            && !self
                .entries
                .iter()
                .any(|e| e.self_test == Some(SelfTestResult::Failed))
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", render_table(&self.entries))?;
        write!(f, "{}", self.iris_line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn settings_in(dir: &std::path::Path, binary: &str) -> FvpSettings {
        let json = format!(
            r#"{{
                "COMMON": {{"configs": {{"DEFAULT": "MPS2.conf", "MISSING": "NOPE.conf"}}}},
                "FVP_B": {{"model_binary": "{binary}", "terminal_component": "uart0"}},
                "FVP_A": {{"model_binary": "/nonexistent/FVP_A", "terminal_component": "uart0"}}
            }}"#
        );
        FvpSettings::from_json(&json).unwrap().with_base_dir(dir)
    }

    #[test]
    fn test_catalog_availability() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("configs")).unwrap();
        fs::write(dir.path().join("configs").join("MPS2.conf"), "a=1\n").unwrap();
        let binary = dir.path().join("FVP_B");
        fs::write(&binary, b"").unwrap();

        let entries = catalog(&settings_in(dir.path(), &binary.display().to_string()));
        let summary: Vec<(&str, &str, Availability)> = entries
            .iter()
            .map(|e| (e.model.as_str(), e.config_name.as_str(), e.availability))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("FVP_A", "DEFAULT", Availability::NoModelBinary),
                ("FVP_A", "MISSING", Availability::NoModelBinary),
                ("FVP_B", "DEFAULT", Availability::Yes),
                ("FVP_B", "MISSING", Availability::NoConfigFile),
            ]
        );
    }

    #[test]
    fn test_render_table_groups_models() {
        let dir = tempfile::tempdir().unwrap();
        let mut entries = catalog(&settings_in(dir.path(), "/nonexistent/FVP_B"));
        let table = render_table(&entries);
        let lines: Vec<&str> = table.lines().collect();

        assert!(lines[0].starts_with("+-"));
        assert!(lines[1].contains("MODEL NAME"));
        assert!(!lines[1].contains("SELF TEST"));
        assert!(lines[3].starts_with("| FVP_A "));
        assert!(lines[5].starts_with("|       "));
        assert!(table.contains("NO  'MODEL BINARY' NOT EXIST"));
        let width = lines[0].chars().count();
        assert!(lines.iter().all(|l| l.chars().count() == width));

        entries[0].self_test = Some(SelfTestResult::Skipped);
        let table = render_table(&entries);
        assert!(table.contains("SELF TEST"));
        assert!(table.contains("SKIPPED"));
    }

    #[test]
    fn test_report_success() {
        let dir = tempfile::tempdir().unwrap();
        let iris = dir.path().join("Iris");
        fs::create_dir(&iris).unwrap();
        let json = format!(
            r#"{{"COMMON": {{"IRIS_path": "{}", "configs": {{"DEFAULT": "MPS2.conf"}}}},
                "FVP_A": {{"model_binary": "/nonexistent/FVP_A", "terminal_component": "uart0"}}}}"#,
            iris.display()
        );
        let settings = FvpSettings::from_json(&json).unwrap().with_base_dir(dir.path());

        let mut report = Report::new(&settings, catalog(&settings));
        assert!(report.iris_found);
        assert!(report.success());
        assert!(report.to_string().ends_with(&format!(
            "Import IRIS Test ... PASSED ({})",
            iris.display()
        )));

        report.entries[0].self_test = Some(SelfTestResult::Failed);
        assert!(!report.success());

        let missing = FvpSettings::from_json(
            r#"{"COMMON": {"IRIS_path": "/nonexistent/iris"}}"#,
        )
        .unwrap();
        let report = Report::new(&missing, Vec::new());
        assert!(!report.success());
        assert_eq!(report.iris_line, "Import IRIS Test ... FAILED");
    }
}
