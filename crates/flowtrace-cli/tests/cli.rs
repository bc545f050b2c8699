//! End-to-end tests for the flowtrace binary.
//!
//! These run the real binary but stop short of probing: everything here
//! fails before a raw socket would be needed, so no privileges are
//! required.

use std::process::Command;

fn flowtrace() -> Command {
    Command::new(env!("CARGO_BIN_EXE_flowtrace"))
}

#[test]
fn test_help_describes_flow_options() {
    let output = flowtrace().arg("--help").output().unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("--npaths"));
    assert!(stdout.contains("--max-ttl"));
    assert!(stdout.contains("--reverse-dns"));
}

#[test]
fn test_missing_target_is_a_usage_error() {
    let output = flowtrace().output().unwrap();
    assert!(!output.status.success());

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.to_lowercase().contains("target"));
}

#[test]
fn test_unknown_protocol_rejected() {
    let output = flowtrace()
        .args(["127.0.0.1", "--proto", "sctp"])
        .output()
        .unwrap();
    assert!(!output.status.success());

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unknown protocol"));
}

#[test]
fn test_invalid_flow_count_rejected_before_probing() {
    let output = flowtrace()
        .args(["127.0.0.1", "--npaths", "0"])
        .output()
        .unwrap();
    assert!(!output.status.success());

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("num_paths"));
}

#[test]
fn test_source_port_window_overflow_rejected() {
    let output = flowtrace()
        .args(["127.0.0.1", "--sport", "65530", "--npaths", "16"])
        .output()
        .unwrap();
    assert!(!output.status.success());

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("65535"));
}

#[test]
fn test_ipv6_target_rejected() {
    let output = flowtrace().arg("2001:db8::1").output().unwrap();
    assert!(!output.status.success());

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("IPv6"));
}
