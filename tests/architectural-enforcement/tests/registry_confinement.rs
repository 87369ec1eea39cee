//! Integration Test: Callback Registry Confinement
//!
//! **Policy**: Callback ids are allocated only by the transport primitives
//! that own their lifecycle (one-shot invocations and channels). Anything
//! else allocating an id would leak it, since nothing would free it.
//!
//! **Policy**: The demo reaches the transport through `Bridge` only and never
//! touches the registry directly.

use std::path::Path;

use architectural_enforcement::scan;

/// Core modules permitted to allocate callback ids
const ALLOCATORS: &[&str] = &["registry.rs", "invoker.rs", "channel.rs"];

fn file_name(path: &Path) -> &str {
    path.file_name().and_then(|s| s.to_str()).unwrap_or_default()
}

#[test]
fn test_allocation_confined_to_transport_primitives() {
    let violations = scan(&["bridge/core/src"], |path, code| {
        code.contains(".allocate(") && !ALLOCATORS.contains(&file_name(path))
    });

    if !violations.is_empty() {
        eprintln!("\n❌ Callback ids allocated outside the transport primitives!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n✅ Open a Channel or go through Invoker::invoke instead.");

        panic!("\nFound {} stray allocation(s).", violations.len());
    }
}

#[test]
fn test_demo_does_not_touch_registry() {
    let violations = scan(&["bridge/demo/src"], |_, code| {
        code.contains("CallbackRegistry") || code.contains(".allocate(")
    });

    if !violations.is_empty() {
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        panic!(
            "\nDemo code reaches into the callback registry ({} line(s)).",
            violations.len()
        );
    }
}
