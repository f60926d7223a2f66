//! Append-only CSV of first sightings: `identity,name,timestamp`.

use chrono::{DateTime, Local};
use rollcall_core::Identity;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const HEADER: &str = "identity,name,timestamp";

pub struct AttendanceLog {
    path: PathBuf,
    file: File,
}

impl AttendanceLog {
    /// Open for appending, writing the header if the file is new or empty.
    pub fn open(path: &Path) -> io::Result<Self> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        if file.metadata()?.len() == 0 {
            writeln!(file, "{HEADER}")?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&mut self, identity: &Identity, at: DateTime<Local>) -> io::Result<()> {
        writeln!(
            self.file,
            "{},{},{}",
            csv_field(&identity.id),
            csv_field(&identity.name),
            at.format("%Y-%m-%d %H:%M:%S")
        )?;
        self.file.flush()
    }
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
