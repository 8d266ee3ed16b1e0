use std::sync::Mutex;
use std::thread::available_parallelism;

use anyhow::bail;
use log::{debug, warn};

use crate::common::{parse_int_from_str, Res};

/// A disjoint set of CPUs claimed by one worker for the lifetime of a round
/// task; the child engines of that task are pinned to it.
#[derive(Debug, Clone, Eq, PartialEq)]
#[must_use]
pub struct CpuGroup {
    pub cpus: Vec<usize>,
}

/// Partitions the usable CPUs into `concurrency` disjoint groups and hands
/// them out to workers. Claims are first-come-first-served; every claim is
/// returned when the task finishes.
#[derive(Debug)]
pub struct AffinityPool {
    groups: Mutex<Vec<CpuGroup>>,
}

impl AffinityPool {
    /// `cpus` is the explicit `-use-affinity` list, or empty for all CPUs.
    pub fn new(mut cpus: Vec<usize>, concurrency: usize) -> Res<Self> {
        if cpus.is_empty() {
            let count = available_parallelism().map(|n| n.get()).unwrap_or(1);
            cpus = (0..count).collect();
        }
        if cpus.len() < concurrency {
            bail!(
                "cannot partition {} CPUs into {concurrency} affinity groups",
                cpus.len()
            )
        }
        let mut groups: Vec<CpuGroup> = (0..concurrency).map(|_| CpuGroup { cpus: vec![] }).collect();
        for (i, cpu) in cpus.into_iter().enumerate() {
            groups[i % concurrency].cpus.push(cpu);
        }
        Ok(AffinityPool { groups: Mutex::new(groups) })
    }

    pub fn claim(&self) -> Option<CpuGroup> {
        self.groups.lock().unwrap().pop()
    }

    pub fn release(&self, group: CpuGroup) {
        self.groups.lock().unwrap().push(group);
    }
}

/// Parses a cutechess-style CPU list: `0-3,8,10-11`.
pub fn parse_cpu_list(list: &str) -> Res<Vec<usize>> {
    let mut cpus = vec![];
    for part in list.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.split_once('-') {
            Some((from, to)) => {
                let from: usize = parse_int_from_str(from, "the first CPU of a range")?;
                let to: usize = parse_int_from_str(to, "the last CPU of a range")?;
                if from > to {
                    bail!("invalid CPU range '{part}'")
                }
                cpus.extend(from..=to);
            }
            None => cpus.push(parse_int_from_str(part, "a CPU number")?),
        }
    }
    cpus.sort_unstable();
    cpus.dedup();
    Ok(cpus)
}

/// Pins the given process to the group's CPUs. Only Linux exposes a
/// per-process affinity call; Apple hosts in particular have none, so
/// everywhere else this is a no-op.
#[cfg(target_os = "linux")]
pub fn pin_process(pid: u32, group: &CpuGroup) {
    // SAFETY: cpu_set_t is plain data; the libc macros only write into it.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        for &cpu in &group.cpus {
            libc::CPU_SET(cpu, &mut set);
        }
        if libc::sched_setaffinity(pid as libc::pid_t, std::mem::size_of::<libc::cpu_set_t>(), &set)
            != 0
        {
            warn!("failed to pin process {pid} to CPUs {:?}", group.cpus);
        } else {
            debug!("pinned process {pid} to CPUs {:?}", group.cpus);
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn pin_process(pid: u32, group: &CpuGroup) {
    debug!("process affinity is not supported on this host ({pid}, {:?})", group.cpus);
}
