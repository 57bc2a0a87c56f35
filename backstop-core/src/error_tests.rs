/*!
Tests for error classification and the error kind surface.
*/

#[cfg(test)]
mod tests {
    use crate::error::{BackupError, ErrorKind, SourceFault};
    use backstop_retry::RetryableError;
    use std::io;

    #[test]
    fn test_backup_error_display() {
        let error = BackupError::validation("test validation error");
        assert_eq!(error.to_string(), "Validation error: test validation error");

        let error = BackupError::transform("gzip stream failed");
        assert_eq!(error.to_string(), "Transform error: gzip stream failed");

        let error = BackupError::policy("negative retention window");
        assert_eq!(error.to_string(), "Policy error: negative retention window");
    }

    #[test]
    fn test_backup_error_from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let backup_error = BackupError::from(io_error);

        assert!(matches!(backup_error, BackupError::Io(_)));
        assert_eq!(backup_error.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_stream_error_keeps_source_identity() {
        let io_error = SourceFault("mysqldump exited with status 2".to_string()).into_io();
        let backup_error = BackupError::from_stream_error(io_error);

        match backup_error {
            BackupError::Source(msg) => assert!(msg.contains("status 2")),
            other => panic!("Expected source error, got {other:?}"),
        }
    }

    #[test]
    fn test_stream_error_without_marker_is_transform() {
        let io_error = io::Error::new(io::ErrorKind::InvalidData, "corrupt deflate stream");
        let backup_error = BackupError::from_stream_error(io_error);
        assert_eq!(backup_error.kind(), ErrorKind::Transform);
    }

    #[test]
    fn test_write_error_classification() {
        let full = io::Error::from_raw_os_error(28);
        assert_eq!(
            BackupError::from_write_error(full, "writing dump").kind(),
            ErrorKind::DiskFull
        );

        let interrupted = io::Error::new(io::ErrorKind::Interrupted, "signal");
        let error = BackupError::from_write_error(interrupted, "writing dump");
        assert!(matches!(error, BackupError::Write { transient: true, .. }));

        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "read-only fs");
        let error = BackupError::from_write_error(denied, "writing dump");
        assert!(matches!(error, BackupError::Write { transient: false, .. }));
    }

    #[test]
    fn test_only_network_and_transient_writes_are_retried() {
        assert!(BackupError::network("connection reset").is_transient());
        assert!(BackupError::Write {
            message: "interrupted".to_string(),
            transient: true
        }
        .is_transient());

        assert!(BackupError::auth("bad key").is_permanent());
        assert!(BackupError::DiskFull("no space".to_string()).is_permanent());
        assert!(BackupError::write("permission denied").is_permanent());
        assert!(BackupError::source_error("timeout").is_permanent());
    }

    #[test]
    fn test_integrity_check_failed_error() {
        let error = BackupError::IntegrityCheckFailed {
            key: "orders_2024-05-01_0200.sql.gz".to_string(),
            expected: "abc123".to_string(),
            actual: "def456".to_string(),
        };

        assert!(error.to_string().contains("abc123"));
        assert!(error.to_string().contains("def456"));
        assert_eq!(error.kind(), ErrorKind::Integrity);
    }

    #[test]
    fn test_error_kind_serializes_as_taxonomy_name() {
        let json = serde_json::to_string(&ErrorKind::DuplicateKey).unwrap();
        assert_eq!(json, "\"DuplicateKeyError\"");
        assert_eq!(ErrorKind::PartialSync.to_string(), "PartialSyncError");
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<BackupError>();
        assert_sync::<BackupError>();
    }

    #[test]
    fn test_error_result_type() {
        fn returns_error() -> crate::Result<()> {
            Err(BackupError::validation("test error"))
        }

        let result = returns_error();
        assert!(result.is_err());
    }
}
