// gpu/mod.rs — wgpu compute backend.
//
// Every elementwise kernel of the detector (colour conversion, triangle
// convolution, resampling, gradients, histograms, concatenation and the
// cascade passes) has a WGSL implementation here that mirrors the host
// reference in the parent crate. The host versions remain authoritative:
// each GPU kernel is validated against them in the ignored parity tests.
//
// Architecture: one ordered queue per device.
//
//   Kernels are submitted in program order; later dispatches observe the
//   writes of earlier ones without host synchronisation. The host only
//   blocks when it downloads: once per detection call for the per-row
//   survivor counts, and once for the final boxes.
//
// Shaders live in src/shaders/ and are specialised for the device's
// workgroup size by template substitution when the pipelines are built.

pub mod device;
pub mod kernels;

/// Run one `#[ignore]`d test in a child `cargo test` and return its output.
///
/// Some Vulkan drivers crash on process exit after a device was created;
/// isolating each GPU test in its own process keeps the parent runner
/// alive. The inner test prints `GPU_TEST_OK` when it passes.
#[cfg(test)]
pub(crate) fn run_gpu_test_in_subprocess(test_name: &str) -> String {
    let output = std::process::Command::new("cargo")
        .args(["test", "--lib", "--", test_name, "--exact", "--ignored", "--nocapture"])
        .output()
        .unwrap_or_else(|e| panic!("failed to spawn subprocess for {test_name}: {e}"));
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    print!("{stdout}");
    eprint!("{stderr}");
    stdout + &stderr
}
