/*!
Tests for snapshot metadata including edge cases and serialized layout.
*/

#[cfg(test)]
mod tests {
    use crate::device::{DeviceId, TransportMethod};
    use crate::metadata::{CaptureInfo, DeviceInfo, SnapshotId, SnapshotMetadata};

    fn device(id: &str) -> DeviceId {
        DeviceId::new(id).unwrap()
    }

    #[test]
    fn test_metadata_timestamp_is_now() {
        let metadata = SnapshotMetadata::new(device("fw-01"), 42, TransportMethod::SshCli);

        let time_diff = (chrono::Utc::now() - metadata.captured_at)
            .num_seconds()
            .abs();
        assert!(time_diff <= 5);
        assert_eq!(metadata.content_hash, "");
        assert!(metadata.is_compatible());
    }

    #[test]
    fn test_metadata_serialization_roundtrip() {
        let metadata = SnapshotMetadata::new(device("fw-01"), 123, TransportMethod::RestApi)
            .with_content_hash(b"config firewall policy\nend\n")
            .with_capture_info(
                CaptureInfo::new(TransportMethod::RestApi)
                    .with_device_info(Some(DeviceInfo {
                        model: Some("FGT100F".to_string()),
                        version: Some("7.4.1".to_string()),
                        build: None,
                    }))
                    .with_job("job-1"),
            );

        let json = serde_json::to_string(&metadata).unwrap();
        let deserialized: SnapshotMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(metadata, deserialized);
    }

    #[test]
    fn test_metadata_json_structure() {
        let metadata = SnapshotMetadata::new(device("fw-07"), 5, TransportMethod::Scp)
            .with_content_hash(b"abc");

        let json = serde_json::to_string_pretty(&metadata).unwrap();

        assert!(json.contains("\"snapshot_id\": \"fw-07:000005\""));
        assert!(json.contains("\"transport\": \"scp\""));
        assert!(json.contains("captured_at"));
        assert!(json.contains("content_hash"));
        assert!(json.contains("format_version"));
    }

    #[test]
    fn test_metadata_without_optional_fields_deserializes() {
        let json = r#"{
            "snapshot_id": "fw-01:000001",
            "device_id": "fw-01",
            "sequence": 1,
            "captured_at": "2024-03-01T10:00:00Z",
            "content_hash": "916f0027a575074ce72a331777c3478d6513f786a591bd892da1a577bf2335f9",
            "size": 9,
            "stored_size": null,
            "compression_algorithm": "none",
            "transport": "ssh_cli",
            "format_version": 1
        }"#;
        let metadata: SnapshotMetadata = serde_json::from_str(json).unwrap();
        assert!(metadata.device_info.is_none());
        assert!(metadata.validate().is_ok());
        assert!(metadata.verify_integrity(b"test data").is_ok());
    }

    #[test]
    fn test_future_format_version_is_incompatible() {
        let mut metadata = SnapshotMetadata::new(device("fw-01"), 0, TransportMethod::SshCli);
        metadata.format_version = 9;
        assert!(!metadata.is_compatible());
    }

    #[test]
    fn test_snapshot_ids_sort_in_sequence_order() {
        let mut ids = vec![
            SnapshotId::new(device("fw-01"), 10),
            SnapshotId::new(device("fw-01"), 2),
            SnapshotId::new(device("fw-01"), 1),
        ];
        ids.sort();
        let sequences: Vec<u64> = ids.iter().map(|id| id.sequence()).collect();
        assert_eq!(sequences, vec![1, 2, 10]);
    }

    #[test]
    fn test_short_hash_and_filename() {
        let metadata = SnapshotMetadata::new(device("fw-01"), 0, TransportMethod::SshCli)
            .with_content_hash(b"test data")
            .with_captured_at(
                chrono::DateTime::parse_from_rfc3339("2024-05-06T07:08:09Z")
                    .unwrap()
                    .with_timezone(&chrono::Utc),
            );
        assert_eq!(metadata.short_hash(), "916f0027a575");
        assert_eq!(metadata.suggested_filename(), "fw-01_20240506_070809.conf");
    }

    #[test]
    fn test_device_info_partial_header() {
        let info = DeviceInfo::from_export("#config-version=FWF40F\nconfig system global\nend\n")
            .unwrap();
        assert_eq!(info.model.as_deref(), Some("FWF40F"));
        assert!(info.version.is_none());
        assert!(info.build.is_none());
    }
}
