//! Corruption scenarios that must kill the process.
//!
//! Each scenario runs in a subprocess: the test re-spawns its own binary
//! with a scenario name in the environment, the child runs that scenario
//! through `scenario_driver`, and the parent checks the exit status and
//! stderr of the child.

use std::{env, process::Command};

use guardalloc::{
    secure_alloc_with, secure_free_with, Capabilities, RegionGeometry, TIER_ENV_VAR,
};

const SCENARIO_VAR: &str = "GUARDALLOC_ABORT_SCENARIO";

fn spawn_scenario(scenario_name: &str, extra_env: &[(&str, &str)]) -> std::process::Output {
    let exe = env::current_exe().expect("cannot determine test binary path");

    let mut cmd = Command::new(exe);
    cmd.env(SCENARIO_VAR, scenario_name)
        .env("RUST_TEST_THREADS", "1")
        // Scenarios assume the platform's native tier unless they opt in.
        .env_remove(TIER_ENV_VAR)
        .arg("--exact")
        .arg("scenario_driver")
        .arg("--nocapture");
    for (key, value) in extra_env {
        cmd.env(key, value);
    }

    cmd.output().expect("failed to spawn subprocess")
}

fn expect_abort_subprocess(scenario_name: &str, expected_msg: &str) {
    let output = spawn_scenario(scenario_name, &[]);
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(
        !output.status.success(),
        "subprocess for scenario '{}' should have died, but exited cleanly. stderr:\n{}",
        scenario_name,
        stderr
    );

    if !expected_msg.is_empty() {
        assert!(
            stderr.contains(expected_msg),
            "subprocess stderr for scenario '{}' does not contain '{}'. Full stderr:\n{}",
            scenario_name,
            expected_msg,
            stderr
        );
    }
}

fn expect_clean_subprocess(scenario_name: &str, extra_env: &[(&str, &str)]) {
    let output = spawn_scenario(scenario_name, extra_env);
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(
        output.status.success(),
        "subprocess for scenario '{}' failed. stderr:\n{}",
        scenario_name,
        stderr
    );
}

/// Dispatches to a corruption scenario when run as a subprocess. Does
/// nothing in a regular test run.
#[test]
fn scenario_driver() {
    let scenario = match env::var(SCENARIO_VAR) {
        Ok(scenario) => scenario,
        Err(_) => return,
    };

    match scenario.as_str() {
        "corrupt_leading" => scenario_corrupt_leading(),
        "corrupt_trailing" => scenario_corrupt_trailing(),
        "corrupt_heap_tier" => scenario_corrupt_heap_tier(),
        "assert_heap_tier" => scenario_assert_heap_tier(),
        #[cfg(target_family = "unix")]
        "corrupt_sealed" => scenario_corrupt_sealed(),
        #[cfg(target_family = "unix")]
        "touch_sealed_guard" => scenario_touch_sealed_guard(),
        other => panic!("unknown scenario: {other}"),
    }
}

/// Scenario: stomp the last byte of the leading canary on a tier that
/// leaves canaries readable, then release.
fn scenario_corrupt_leading() {
    let caps = Capabilities::ZERO_FILL_ONLY;
    let ptr = secure_alloc_with(caps, 64).expect("allocation failed");

    unsafe {
        ptr.as_ptr().sub(1).write(0xAA);
        secure_free_with(caps, ptr, 64);
    }
    unreachable!("leading canary corruption was not detected");
}

/// Scenario: stomp the first byte of the trailing canary.
fn scenario_corrupt_trailing() {
    let caps = Capabilities::ZERO_FILL_ONLY;
    let geom = RegionGeometry::for_len(64, caps).expect("geometry overflow");
    let ptr = secure_alloc_with(caps, 64).expect("allocation failed");

    unsafe {
        ptr.as_ptr()
            .add(geom.user_len() + geom.padding_len())
            .write(0x00);
        secure_free_with(caps, ptr, 64);
    }
    unreachable!("trailing canary corruption was not detected");
}

/// Scenario: heap-backed regions carry canary bytes too.
fn scenario_corrupt_heap_tier() {
    let caps = Capabilities::PLAIN_HEAP;
    let ptr = secure_alloc_with(caps, 40).expect("allocation failed");

    unsafe {
        ptr.as_ptr().sub(1).write(0x12);
        secure_free_with(caps, ptr, 40);
    }
    unreachable!("heap tier canary corruption was not detected");
}

/// Scenario: a child started with the tier override must honor it.
fn scenario_assert_heap_tier() {
    let caps = Capabilities::current();
    assert!(!caps.page_aligned(), "tier override was not honored");
    assert!(!caps.seals_guards());

    let ptr = secure_alloc_with(caps, 16).expect("allocation failed");
    unsafe { secure_free_with(caps, ptr, 16) };
}

/// Scenario: unseal the leading canary page behind the allocator's back,
/// corrupt it, then release.
#[cfg(target_family = "unix")]
fn scenario_corrupt_sealed() {
    let caps = Capabilities::current();
    assert!(caps.seals_guards(), "expected a sealing tier");

    let page = guardalloc::page_size();
    let ptr = secure_alloc_with(caps, 64).expect("allocation failed");

    unsafe {
        let leading = ptr.as_ptr().sub(page);
        let rc = libc::mprotect(
            leading.cast::<libc::c_void>(),
            page,
            libc::PROT_READ | libc::PROT_WRITE,
        );
        assert_eq!(rc, 0, "mprotect failed");

        leading.write(0xAA);
        secure_free_with(caps, ptr, 64);
    }
    unreachable!("sealed canary corruption was not detected");
}

/// Scenario: merely touching a sealed canary page faults.
#[cfg(target_family = "unix")]
fn scenario_touch_sealed_guard() {
    let caps = Capabilities::current();
    assert!(caps.seals_guards(), "expected a sealing tier");

    let ptr = secure_alloc_with(caps, 64).expect("allocation failed");

    unsafe {
        let _ = ptr.as_ptr().sub(1).read_volatile();
        secure_free_with(caps, ptr, 64);
    }
    unreachable!("sealed guard page was readable");
}

#[test]
fn leading_canary_corruption_aborts() {
    expect_abort_subprocess("corrupt_leading", "leading canary corrupted");
}

#[test]
fn trailing_canary_corruption_aborts() {
    expect_abort_subprocess("corrupt_trailing", "trailing canary corrupted");
}

#[test]
fn heap_tier_corruption_aborts() {
    expect_abort_subprocess("corrupt_heap_tier", "leading canary corrupted");
}

#[test]
fn tier_override_reaches_child_processes() {
    expect_clean_subprocess("assert_heap_tier", &[(TIER_ENV_VAR, "heap")]);
}

#[cfg(target_family = "unix")]
#[test]
fn sealed_canary_corruption_aborts() {
    expect_abort_subprocess("corrupt_sealed", "leading canary corrupted");
}

#[cfg(target_family = "unix")]
#[test]
fn touching_a_sealed_guard_page_crashes() {
    expect_abort_subprocess("touch_sealed_guard", "");
}
