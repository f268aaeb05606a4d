use super::*;
use tempfile::tempdir;

#[test]
fn default_config_validates() {
    assert!(StorageGroupConfig::default().validate().is_ok());
}

#[test]
fn partial_toml_falls_back_to_defaults() {
    let config = StorageGroupConfig::from_toml_str("memtable_size_threshold = 1024\n").unwrap();
    assert_eq!(config.memtable_size_threshold, 1024);
    assert_eq!(config.partition_interval_ms, StorageGroupConfig::default().partition_interval_ms);
}

#[test]
fn merge_strategy_parses_snake_case() {
    let config = StorageGroupConfig::from_toml_str("merge_strategy = \"squeeze\"\n").unwrap();
    assert_eq!(config.merge_strategy, MergeStrategy::Squeeze);
}

#[test]
fn round_trips_through_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("storage_group.toml");

    let mut config = StorageGroupConfig::default();
    config.merge_strategy = MergeStrategy::IndependenceSize;
    config.max_degree_of_index_node = 128;
    std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();

    let loaded = StorageGroupConfig::load(&path).unwrap();
    assert_eq!(loaded, config);
}

#[test]
fn zero_partition_interval_is_rejected() {
    let err = StorageGroupConfig::from_toml_str("partition_interval_ms = 0\n").unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)));
}

#[test]
fn degree_below_two_is_rejected() {
    let err = StorageGroupConfig::from_toml_str("max_degree_of_index_node = 1\n").unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)));
}

#[test]
fn out_of_range_bloom_error_rate_is_rejected() {
    let err = StorageGroupConfig::from_toml_str("bloom_filter_error_rate = 1.5\n").unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)));
}

#[test]
fn malformed_toml_is_a_parse_error() {
    let err = StorageGroupConfig::from_toml_str("not valid toml = [").unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));
}
