//! Platform-aware memory probing.
//!
//! On Darwin, "free" pages under-report what is actually reclaimable, so
//! available memory is computed from `vm_stat` as
//! free + inactive + purgeable + speculative pages. Everywhere else the
//! OS available-memory counter is used directly.

/// Hard floor below which no agent process is spawned.
pub const MIN_AVAILABLE_MEMORY_BYTES: u64 = 512 * 1024 * 1024;

/// Best-effort available memory in bytes.
pub fn available_memory_bytes() -> u64 {
    #[cfg(target_os = "macos")]
    {
        if let Some(bytes) = darwin_available() {
            return bytes;
        }
    }

    let mut sys = sysinfo::System::new();
    sys.refresh_memory();
    sys.available_memory()
}

#[cfg(target_os = "macos")]
fn darwin_available() -> Option<u64> {
    let output = std::process::Command::new("vm_stat").output().ok()?;
    if !output.status.success() {
        return None;
    }
    parse_vm_stat(&String::from_utf8_lossy(&output.stdout))
}

/// Parse `vm_stat` output into available bytes.
///
/// Counts free, inactive, purgeable, and speculative pages; the header
/// line carries the page size.
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn parse_vm_stat(output: &str) -> Option<u64> {
    let page_size: u64 = output
        .lines()
        .next()?
        .split("page size of ")
        .nth(1)?
        .split_whitespace()
        .next()?
        .parse()
        .ok()?;

    let mut pages: u64 = 0;
    let mut matched = false;
    for line in output.lines() {
        let Some((label, value)) = line.split_once(':') else {
            continue;
        };
        let label = label.trim();
        if matches!(
            label,
            "Pages free" | "Pages inactive" | "Pages purgeable" | "Pages speculative"
        ) {
            let count: u64 = value.trim().trim_end_matches('.').parse().ok()?;
            pages += count;
            matched = true;
        }
    }

    matched.then_some(pages * page_size)
}

/// Resident set size of one process in bytes, if it is still alive.
pub fn process_rss_bytes(sys: &mut sysinfo::System, pid: u32) -> Option<u64> {
    let pid = sysinfo::Pid::from_u32(pid);
    sys.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
    sys.process(pid).map(|p| p.memory())
}
