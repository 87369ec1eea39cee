//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Transport and demo code MUST NOT sleep. Replies arrive through
//! the delivery loop and periodic work uses `tokio::time::interval`, so a
//! sleep is always a polling loop in disguise.
//!
//! **Acceptable**: test modules, which are not scanned.

use architectural_enforcement::{scan, PRODUCTION_DIRS};

fn is_sleep_call(code: &str) -> bool {
    code.contains("::sleep(") || code.contains(".sleep(")
}

#[test]
fn test_no_sleep_in_production_code() {
    let violations = scan(PRODUCTION_DIRS, |_, code| is_sleep_call(code));

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: sleep() calls found in production code!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n✅ Use instead:");
        eprintln!("  - DeliveryLoop::run() / spawn() to wait for host replies");
        eprintln!("  - tokio::time::interval() for periodic work");

        panic!(
            "\nFound {} sleep() violation(s) in production code.",
            violations.len()
        );
    }
}

#[test]
fn test_sleep_detector() {
    assert!(is_sleep_call("    tokio::time::sleep(Duration::from_millis(10)).await;"));
    assert!(is_sleep_call("    std::thread::sleep(period);"));
    assert!(is_sleep_call("    handle.sleep(period);"));
    assert!(!is_sleep_call("    let mut interval = tokio::time::interval(period);"));
    assert!(!is_sleep_call("    interval.tick().await;"));
}
