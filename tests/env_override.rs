//! Environment overrides.
//!
//! Kept in its own test binary: it mutates process environment variables.

use std::io::Write;

use stc_daq::config::AppConfig;

#[test]
fn test_environment_overrides_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(
        br#"
        [application]
        log_level = "info"

        [driver.counter_read]
        max_save_reads = 3
        "#,
    )
    .unwrap();

    std::env::set_var("STC_DAQ_APPLICATION__LOG_LEVEL", "trace");
    std::env::set_var("STC_DAQ_DRIVER__COUNTER_READ__MAX_SAVE_READS", "6");
    let config = AppConfig::load_from(file.path());
    std::env::remove_var("STC_DAQ_APPLICATION__LOG_LEVEL");
    std::env::remove_var("STC_DAQ_DRIVER__COUNTER_READ__MAX_SAVE_READS");

    let config = config.unwrap();
    assert_eq!(config.application.log_level, "trace");
    assert_eq!(config.driver.counter_read.max_save_reads, 6);
}
