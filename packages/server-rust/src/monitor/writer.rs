//! Sink for diagnostics sections and the writers shipped with the server.

use serde::Serialize;
use tracing::info;

/// Receives a diagnostics report as nested named sections of scalar entries.
pub trait DiagnosticsWriter: Send {
    /// Opens a section nested in the currently open one, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the writer cannot accept more output.
    fn start_section(&mut self, name: &str) -> anyhow::Result<()>;

    /// Adds `key = value` to the open section.
    ///
    /// # Errors
    ///
    /// Returns an error if no section is open or the writer failed.
    fn write_entry(&mut self, key: &str, value: u64) -> anyhow::Result<()>;

    /// Closes the innermost open section.
    ///
    /// # Errors
    ///
    /// Returns an error if no section is open or the writer failed.
    fn end_section(&mut self) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// In-memory report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entry {
    pub key: String,
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Section {
    pub name: String,
    pub entries: Vec<Entry>,
    pub sections: Vec<Section>,
}

impl Section {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: Vec::new(),
            sections: Vec::new(),
        }
    }

    #[must_use]
    pub fn entry(&self, key: &str) -> Option<u64> {
        self.entries.iter().find(|e| e.key == key).map(|e| e.value)
    }

    #[must_use]
    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }
}

/// Collects sections into a tree that can be inspected or serialized.
#[derive(Debug, Default, Serialize)]
pub struct DiagnosticsReport {
    sections: Vec<Section>,
    #[serde(skip)]
    open: Vec<Section>,
}

impl DiagnosticsReport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Completed top-level sections.
    #[must_use]
    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// Looks up a completed section by its path of names.
    #[must_use]
    pub fn find(&self, path: &[&str]) -> Option<&Section> {
        let (first, rest) = path.split_first()?;
        let mut section = self.sections.iter().find(|s| s.name == *first)?;
        for name in rest {
            section = section.section(name)?;
        }
        Some(section)
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.open.is_empty()
    }

    /// Drops completed and open sections.
    pub fn clear(&mut self) {
        self.sections.clear();
        self.open.clear();
    }

    /// Serializes the completed sections.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.sections)
    }
}

impl DiagnosticsWriter for DiagnosticsReport {
    fn start_section(&mut self, name: &str) -> anyhow::Result<()> {
        self.open.push(Section::new(name));
        Ok(())
    }

    fn write_entry(&mut self, key: &str, value: u64) -> anyhow::Result<()> {
        let section = self
            .open
            .last_mut()
            .ok_or_else(|| anyhow::anyhow!("entry {key} written outside a section"))?;
        section.entries.push(Entry {
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    fn end_section(&mut self) -> anyhow::Result<()> {
        let section = self
            .open
            .pop()
            .ok_or_else(|| anyhow::anyhow!("no open section to end"))?;
        match self.open.last_mut() {
            Some(parent) => parent.sections.push(section),
            None => self.sections.push(section),
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Log writer
// ---------------------------------------------------------------------------

/// Emits each completed top-level section as one `tracing` event.
#[derive(Debug, Default)]
pub struct LogDiagnosticsWriter {
    report: DiagnosticsReport,
}

impl LogDiagnosticsWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl DiagnosticsWriter for LogDiagnosticsWriter {
    fn start_section(&mut self, name: &str) -> anyhow::Result<()> {
        self.report.start_section(name)
    }

    fn write_entry(&mut self, key: &str, value: u64) -> anyhow::Result<()> {
        self.report.write_entry(key, value)
    }

    fn end_section(&mut self) -> anyhow::Result<()> {
        self.report.end_section()?;
        if !self.report.is_open() {
            let rendered = self.report.to_json();
            self.report.clear();
            let rendered = rendered?;
            info!(target: "relaygrid::diagnostics", report = %rendered, "diagnostics");
        }
        Ok(())
    }
}
