use std::{fs, io};

/// Resources held by every live process of one process group.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct GroupUsage {
    /// User plus system time, including reaped children, in seconds.
    pub cpu_time: f64,
    pub rss_kb: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct StatFields {
    pgrp: i32,
    ticks: u64,
    rss_pages: u64,
}

/// Sums `/proc/<pid>/stat` over the processes whose group is `pgid`.
pub fn group_usage(pgid: i32) -> io::Result<GroupUsage> {
    let clock_ticks = sysconf(libc::_SC_CLK_TCK, 100);
    let page_kb = sysconf(libc::_SC_PAGESIZE, 4096) / 1024;

    let mut ticks = 0;
    let mut usage = GroupUsage::default();
    for entry in fs::read_dir("/proc")? {
        let Ok(entry) = entry else { continue };
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }

        // Processes may exit between listing and reading.
        let Ok(content) = fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        let Some(stat) = parse_stat(&content) else {
            continue;
        };
        if stat.pgrp != pgid {
            continue;
        }

        ticks += stat.ticks;
        usage.rss_kb += stat.rss_pages * page_kb;
    }

    usage.cpu_time = ticks as f64 / clock_ticks as f64;
    Ok(usage)
}

fn parse_stat(content: &str) -> Option<StatFields> {
    // The command name may itself contain spaces and parentheses.
    let rest = &content[content.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let num = |idx: usize| fields.get(idx)?.parse::<u64>().ok();

    Some(StatFields {
        pgrp: fields.get(2)?.parse().ok()?,
        ticks: num(11)? + num(12)? + num(13)? + num(14)?,
        rss_pages: num(21)?,
    })
}

fn sysconf(name: libc::c_int, fallback: u64) -> u64 {
    let value = unsafe { libc::sysconf(name) };
    if value > 0 { value as u64 } else { fallback }
}
