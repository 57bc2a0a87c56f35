/*!
Artifact key naming.

Keys follow `<database>_<YYYY-MM-DD_HHMM>.<ext>`. External tooling reads backup
directories by this pattern, so it must stay stable.
*/

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::{BackupError, Result};

/// `strftime` pattern of the timestamp segment
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H%M";

const TIMESTAMP_LEN: usize = 15;
const MAX_DATABASE_LEN: usize = 64;
const MINUTES_PER_DAY: u32 = 24 * 60;

/// A key split back into its parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedKey {
    pub database: String,
    pub timestamp: DateTime<Utc>,
    pub extension: String,
}

/// Turns (database, timestamp) into collision-free artifact keys.
///
/// Timestamps are truncated to `granularity_minutes`. A second request for the same
/// database inside one window is refused with `DuplicateKey`, whether the earlier key
/// came from this namer or from an existing inventory. The namer itself only
/// remembers the latest window issued per database; older windows are covered by the
/// inventory.
#[derive(Debug)]
pub struct ArtifactNamer {
    granularity_minutes: u32,
    extension: String,
    /// Latest window start issued per database, in epoch seconds
    issued: Mutex<HashMap<String, i64>>,
}

impl ArtifactNamer {
    pub fn new<S: Into<String>>(granularity_minutes: u32, extension: S) -> Result<Self> {
        if granularity_minutes == 0 || MINUTES_PER_DAY % granularity_minutes != 0 {
            return Err(BackupError::policy(format!(
                "naming granularity of {granularity_minutes} minutes must be positive and divide a day"
            )));
        }
        let extension = extension.into();
        if extension.is_empty() || extension.starts_with('.') {
            return Err(BackupError::validation(format!(
                "invalid artifact extension '{extension}'"
            )));
        }
        Ok(Self {
            granularity_minutes,
            extension,
            issued: Mutex::new(HashMap::new()),
        })
    }

    pub fn granularity_minutes(&self) -> u32 {
        self.granularity_minutes
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Start of the naming window containing `timestamp`
    pub fn window_start(&self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        let granularity = i64::from(self.granularity_minutes) * 60;
        let secs = timestamp.timestamp();
        let start = secs - secs.rem_euclid(granularity);
        DateTime::from_timestamp(start, 0).unwrap_or(timestamp)
    }

    /// Produce the key for `database` at `timestamp`.
    ///
    /// `existing` is the current inventory of keys; any key of the same database that
    /// falls in the same window makes this a duplicate.
    pub fn name<S: AsRef<str>>(
        &self,
        database: &str,
        timestamp: DateTime<Utc>,
        existing: &[S],
    ) -> Result<String> {
        validate_database_identifier(database)?;
        let window = self.window_start(timestamp);

        let clash = existing
            .iter()
            .filter_map(|key| Self::parse(key.as_ref()))
            .any(|parsed| parsed.database == database && self.window_start(parsed.timestamp) == window);
        if clash {
            return Err(BackupError::DuplicateKey(format!(
                "an artifact for '{database}' already exists in window {}",
                window.format(TIMESTAMP_FORMAT)
            )));
        }

        let mut issued = self
            .issued
            .lock()
            .map_err(|_| BackupError::validation("artifact namer lock poisoned"))?;
        if issued.get(database) == Some(&window.timestamp()) {
            return Err(BackupError::DuplicateKey(format!(
                "a key for '{database}' was already issued for window {}",
                window.format(TIMESTAMP_FORMAT)
            )));
        }
        issued.insert(database.to_string(), window.timestamp());

        Ok(format!(
            "{database}_{}.{}",
            window.format(TIMESTAMP_FORMAT),
            self.extension
        ))
    }

    /// Split a key into database, timestamp and extension.
    ///
    /// Returns `None` for anything that does not follow the key format, which lets
    /// listings skip foreign files.
    pub fn parse(key: &str) -> Option<ParsedKey> {
        let (stem, extension) = key.split_once('.')?;
        if extension.is_empty() || stem.len() < TIMESTAMP_LEN + 2 {
            return None;
        }
        let split = stem.len() - TIMESTAMP_LEN;
        let database = stem.get(..split)?.strip_suffix('_')?;
        let stamp = stem.get(split..)?;
        if validate_database_identifier(database).is_err() {
            return None;
        }
        let naive = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()?;
        Some(ParsedKey {
            database: database.to_string(),
            timestamp: naive.and_utc(),
            extension: extension.to_string(),
        })
    }
}

/// Database identifiers become file names and object keys; keep them boring.
pub fn validate_database_identifier(database: &str) -> Result<()> {
    if database.is_empty() || database.len() > MAX_DATABASE_LEN {
        return Err(BackupError::validation(format!(
            "database identifier must be 1-{MAX_DATABASE_LEN} characters"
        )));
    }
    if !database
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(BackupError::validation(format!(
            "database identifier '{database}' may only contain ASCII letters, digits, '_' and '-'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_key_format() {
        let namer = ArtifactNamer::new(1, "sql.gz").unwrap();
        let none: &[String] = &[];
        let key = namer.name("orders", at(2024, 5, 1, 2, 7, 42), none).unwrap();
        assert_eq!(key, "orders_2024-05-01_0207.sql.gz");
    }

    #[test]
    fn test_truncates_to_granularity() {
        let namer = ArtifactNamer::new(60, "sql.gz.enc").unwrap();
        let none: &[String] = &[];
        let key = namer.name("orders", at(2024, 5, 1, 2, 59, 0), none).unwrap();
        assert_eq!(key, "orders_2024-05-01_0200.sql.gz.enc");
    }

    #[test]
    fn test_same_window_is_duplicate() {
        let namer = ArtifactNamer::new(15, "sql.gz").unwrap();
        let none: &[String] = &[];
        namer.name("orders", at(2024, 5, 1, 2, 0, 0), none).unwrap();

        let err = namer
            .name("orders", at(2024, 5, 1, 2, 14, 59), none)
            .unwrap_err();
        assert!(matches!(err, BackupError::DuplicateKey(_)));

        // next window and other databases are fine
        assert!(namer.name("orders", at(2024, 5, 1, 2, 15, 0), none).is_ok());
        assert!(namer.name("billing", at(2024, 5, 1, 2, 0, 0), none).is_ok());
    }

    #[test]
    fn test_issued_windows_stay_bounded() {
        let namer = ArtifactNamer::new(15, "sql.gz").unwrap();
        let none: &[String] = &[];
        for day in 1..=28 {
            for hour in 0..24 {
                namer.name("orders", at(2024, 2, day, hour, 0, 0), none).unwrap();
            }
        }
        namer.name("billing", at(2024, 2, 28, 23, 0, 0), none).unwrap();
        assert_eq!(namer.issued.lock().unwrap().len(), 2);

        // the latest window is still refused
        let err = namer
            .name("orders", at(2024, 2, 28, 23, 5, 0), none)
            .unwrap_err();
        assert!(matches!(err, BackupError::DuplicateKey(_)));
    }

    #[test]
    fn test_existing_inventory_is_duplicate_regardless_of_extension() {
        let namer = ArtifactNamer::new(1, "sql.gz").unwrap();
        let existing = vec!["orders_2024-05-01_0200.sql.gz.enc".to_string()];
        let err = namer
            .name("orders", at(2024, 5, 1, 2, 0, 30), &existing)
            .unwrap_err();
        assert!(matches!(err, BackupError::DuplicateKey(_)));
    }

    #[test]
    fn test_prefix_database_does_not_clash() {
        let namer = ArtifactNamer::new(1, "sql.gz").unwrap();
        let existing = vec!["orders_archive_2024-05-01_0200.sql.gz".to_string()];
        assert!(namer.name("orders", at(2024, 5, 1, 2, 0, 0), &existing).is_ok());
    }

    #[test]
    fn test_parse_roundtrip() {
        let parsed = ArtifactNamer::parse("orders_archive_2024-05-01_0200.sql.gz").unwrap();
        assert_eq!(parsed.database, "orders_archive");
        assert_eq!(parsed.timestamp, at(2024, 5, 1, 2, 0, 0));
        assert_eq!(parsed.extension, "sql.gz");
    }

    #[test]
    fn test_parse_rejects_foreign_names() {
        assert!(ArtifactNamer::parse("README.md").is_none());
        assert!(ArtifactNamer::parse("orders_2024-13-01_0200.sql").is_none());
        assert!(ArtifactNamer::parse("_2024-05-01_0200.sql").is_none());
        assert!(ArtifactNamer::parse("orders_2024-05-01_0200").is_none());
        assert!(ArtifactNamer::parse("ordérs_2024-05-01_0200.sql").is_none());
    }

    #[test]
    fn test_invalid_configuration() {
        assert!(matches!(
            ArtifactNamer::new(0, "sql"),
            Err(BackupError::Policy(_))
        ));
        assert!(matches!(
            ArtifactNamer::new(7, "sql"),
            Err(BackupError::Policy(_))
        ));
        assert!(ArtifactNamer::new(5, ".sql").is_err());
    }

    #[test]
    fn test_database_identifier_validation() {
        assert!(validate_database_identifier("orders-eu_1").is_ok());
        assert!(validate_database_identifier("").is_err());
        assert!(validate_database_identifier("orders/../etc").is_err());
        assert!(validate_database_identifier("orders.prod").is_err());
    }
}
