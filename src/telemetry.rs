use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Local};
use tracing::{debug, info};

use crate::classifier::Classification;
use crate::config::TelemetryConfig;
use crate::error::Result;
use crate::gateway::SensorReading;

/// One completed sort cycle, ready to be written to the telemetry log.
#[derive(Debug, Clone)]
pub struct TelemetryRecord {
    pub timestamp: DateTime<Local>,
    /// Fill levels read after actuation; `None` when the sensor poll timed
    /// out, which does not fail the cycle.
    pub levels: Option<SensorReading>,
    pub classification: Classification,
}

impl TelemetryRecord {
    pub fn now(levels: Option<SensorReading>, classification: Classification) -> Self {
        Self {
            timestamp: Local::now(),
            levels,
            classification,
        }
    }
}

/// Destination for per-cycle telemetry records.
pub trait TelemetrySink: Send {
    fn append(&mut self, record: &TelemetryRecord) -> Result<()>;
}

/// Newest-first flat-file telemetry log.
///
/// Each record is one line; new records are prepended so the most recent
/// cycle is always the first line of the file.
pub struct FileTelemetrySink {
    path: PathBuf,
    bin_code: String,
    location: String,
}

impl FileTelemetrySink {
    pub fn new(config: &TelemetryConfig) -> Self {
        Self {
            path: PathBuf::from(&config.path),
            bin_code: config.bin_code.clone(),
            location: config.location.clone(),
        }
    }

    fn format_line(&self, record: &TelemetryRecord) -> String {
        let placeholder = "00".to_string();
        let level = |f: fn(&SensorReading) -> i32| {
            record
                .levels
                .as_ref()
                .map(|r| f(r).to_string())
                .unwrap_or_else(|| placeholder.clone())
        };

        format!(
            "Dustbin Code: {}, Dustbin Location: {}, BR: {}, BNR: {}, NBR: {}, NBNR: {}, \
             Last used: {}, Recyclable tips: {}, Bio degradable facts: {}, Item: {}, Category: {}",
            self.bin_code,
            self.location,
            level(|r| r.br),
            level(|r| r.bnr),
            level(|r| r.nbr),
            level(|r| r.nbnr),
            record.timestamp.format("%Y-%m-%d %H:%M:%S"),
            record.classification.recyclable_tips.as_deref().unwrap_or("None"),
            record.classification.biodegradable_facts.as_deref().unwrap_or("None"),
            record.classification.item,
            record.classification.category,
        )
    }
}

impl TelemetrySink for FileTelemetrySink {
    fn append(&mut self, record: &TelemetryRecord) -> Result<()> {
        let existing = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };

        let mut contents = self.format_line(record);
        contents.push('\n');
        contents.push_str(&existing);
        fs::write(&self.path, contents)?;

        debug!(path = %self.path.display(), "telemetry record written");
        info!(
            item = %record.classification.item,
            category = %record.classification.category,
            "cycle logged"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn classification(item: &str) -> Classification {
        Classification {
            item: item.to_string(),
            category: "Non Bio Degradable and Recyclable".to_string(),
            recyclable_tips: Some("Rinse before binning".to_string()),
            biodegradable_facts: None,
        }
    }

    fn sink(dir: &tempfile::TempDir) -> FileTelemetrySink {
        FileTelemetrySink::new(&TelemetryConfig {
            path: dir.path().join("log.txt").to_string_lossy().into_owned(),
            bin_code: "BIN001".to_string(),
            location: "Lobby".to_string(),
        })
    }

    fn record_at(hour: u32, item: &str, levels: Option<SensorReading>) -> TelemetryRecord {
        TelemetryRecord {
            timestamp: Local.with_ymd_and_hms(2024, 5, 2, hour, 0, 0).unwrap(),
            levels,
            classification: classification(item),
        }
    }

    #[test]
    fn records_are_prepended_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = sink(&dir);

        sink.append(&record_at(9, "Bottle", None)).unwrap();
        sink.append(&record_at(10, "Can", None)).unwrap();

        let contents = fs::read_to_string(dir.path().join("log.txt")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("Item: Can"));
        assert!(lines[1].contains("Item: Bottle"));
    }

    #[test]
    fn line_carries_levels_and_identity() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = sink(&dir);

        let levels = SensorReading {
            br: 2,
            bnr: 3,
            nbr: 11,
            nbnr: 4,
        };
        sink.append(&record_at(9, "Bottle", Some(levels))).unwrap();

        let contents = fs::read_to_string(dir.path().join("log.txt")).unwrap();
        assert!(contents.starts_with("Dustbin Code: BIN001, Dustbin Location: Lobby, "));
        assert!(contents.contains("BR: 2, BNR: 3, NBR: 11, NBNR: 4"));
        assert!(contents.contains("Last used: 2024-05-02 09:00:00"));
        assert!(contents.contains("Recyclable tips: Rinse before binning"));
        assert!(contents.contains("Bio degradable facts: None"));
    }

    #[test]
    fn missing_levels_are_written_as_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = sink(&dir);

        sink.append(&record_at(9, "Bottle", None)).unwrap();

        let contents = fs::read_to_string(dir.path().join("log.txt")).unwrap();
        assert!(contents.contains("BR: 00, BNR: 00, NBR: 00, NBNR: 00"));
    }
}
