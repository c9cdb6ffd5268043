// SPDX-License-Identifier: GPL-2.0

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Result;
use log::debug;
use sscanf::sscanf;

/// Compute the CPU a worker should be pinned to, or `None` to leave it
/// unbound. A stride of 0 disables pinning entirely; otherwise workers are
/// spread `stride` CPUs apart, wrapping around the usable CPU count.
pub fn target_cpu(index: usize, stride: usize, nr_cpus: usize) -> Option<usize> {
    if stride == 0 {
        None
    } else {
        Some((stride * index) % nr_cpus)
    }
}

/// Pin the calling thread to one CPU. Returns false if the platform refuses;
/// callers treat that as non-fatal and keep running unbound.
pub fn bind_current(cpu: usize) -> bool {
    core_affinity::set_for_current(core_affinity::CoreId { id: cpu })
}

/// Parse the contents of /sys/devices/system/cpu/online: comma-separated
/// groups, each either a single CPU id or an inclusive "lo-hi" range.
fn parse_cpu_list(list: &str) -> Result<usize> {
    let mut count = 0;
    for group in list.trim().split(',') {
        let (min, max) = match sscanf!(group.trim(), "{usize}-{usize}") {
            Ok((lo, hi)) => (lo, hi),
            Err(_) => match group.trim().parse::<usize>() {
                Ok(cpu) => (cpu, cpu),
                Err(_) => bail!("Failed to parse online cpus {}", group.trim()),
            },
        };
        if max < min {
            bail!("Invalid cpu range {}", group.trim());
        }
        count += max - min + 1;
    }
    if count == 0 {
        bail!("No online cpus found");
    }
    Ok(count)
}

/// Number of online CPUs, from sysfs where available.
pub fn nr_cpus() -> Result<usize> {
    match std::fs::read_to_string("/sys/devices/system/cpu/online") {
        Ok(online) => parse_cpu_list(&online),
        Err(e) => {
            debug!("could not read online cpus from sysfs: {}", e);
            let ids = core_affinity::get_core_ids()
                .ok_or_else(|| anyhow!("Failed to enumerate CPUs"))?;
            if ids.is_empty() {
                bail!("No usable CPUs reported");
            }
            Ok(ids.len())
        }
    }
}
