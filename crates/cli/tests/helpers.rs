use std::fs;
use std::path::Path;

use keytrace::{default_binary_name, init_tracing, read_keys, UNKNOWN_BINARY};
use tempfile::tempdir;

#[test]
fn keys_are_split_on_any_whitespace_and_deduplicated() {
    let tmp = tempdir().expect("tempdir");
    let path = tmp.path().join("keys.txt");
    fs::write(&path, "lan_ip wan_ip\n\tlan_ip\r\n  dns_server\n\n").expect("write keys");

    let keys = read_keys(&path).expect("read keys");

    assert_eq!(keys.into_iter().collect::<Vec<_>>(), vec!["dns_server", "lan_ip", "wan_ip"]);
}

#[test]
fn missing_keys_file_reports_path() {
    let tmp = tempdir().expect("tempdir");
    let err = read_keys(&tmp.path().join("nope.txt")).expect_err("missing");
    assert!(err.to_string().contains("Failed to read keys file"), "unexpected error: {err}");
}

#[test]
fn binary_name_defaults_to_facts_file_stem() {
    assert_eq!(default_binary_name(Path::new("/fw/squashfs/usr/sbin/httpd.json")), "httpd");
    assert_eq!(default_binary_name(Path::new("rc")), "rc");
}

#[test]
fn binary_name_falls_back_when_stem_missing() {
    assert_eq!(default_binary_name(Path::new("/")), UNKNOWN_BINARY);
    assert_eq!(default_binary_name(Path::new("")), UNKNOWN_BINARY);
}

#[test]
fn tracing_can_be_initialized_twice() {
    init_tracing(2);
    init_tracing(0);
    tracing::info!("subscriber installed");
}
