//! Probe attach glue.
//!
//! Loads the pre-compiled BPF object (the probe programs themselves are built
//! out of tree), attaches one uprobe per instrumented runtime entry point,
//! and exposes the object's ringbuffer and sampling map to the pipeline.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use libbpf_rs::{Link, MapCore, MapHandle, Object, ObjectBuilder, UprobeOpts};
use tracing::info;

use crate::event::EventKind;
use crate::sampling::SamplingMap;
use crate::source::RingbufSource;

/// Ringbuffer map name in the BPF object.
pub const RINGBUF_MAP_NAME: &str = "events";

/// Sampling-rate map name in the BPF object.
pub const SAMPLING_MAP_NAME: &str = "sampling_rates";

/// Instrumented runtime entry points: event kind, runtime symbol, and the
/// handler program name in the BPF object.
pub const RUNTIME_PROBES: [(EventKind, &str, &str); 6] = [
    (EventKind::StateChange, "runtime.casgstatus", "uprobe_casgstatus"),
    (EventKind::MakeSlice, "runtime.makeslice", "uprobe_makeslice"),
    (EventKind::MakeMap, "runtime.makemap", "uprobe_makemap"),
    (EventKind::NewObject, "runtime.newobject", "uprobe_newobject"),
    (EventKind::NewGoroutine, "runtime.newproc1", "uprobe_newproc1"),
    (EventKind::GoExit, "runtime.goexit1", "uprobe_goexit1"),
];

/// Memory lock limit for BPF programs (128 MiB).
const MEMLOCK_RLIMIT_BYTES: u64 = 128 << 20;

/// Bump the memory lock rlimit so BPF maps can be created.
pub fn bump_memlock_rlimit() -> Result<()> {
    let rlimit = libc::rlimit {
        rlim_cur: MEMLOCK_RLIMIT_BYTES,
        rlim_max: MEMLOCK_RLIMIT_BYTES,
    };

    if unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlimit) } != 0 {
        bail!(
            "Failed to increase RLIMIT_MEMLOCK to {} MiB. This is required for BPF maps.",
            MEMLOCK_RLIMIT_BYTES >> 20
        );
    }

    Ok(())
}

/// Resolve the executable to instrument: an explicit binary path, or the
/// running image of a PID via procfs.
pub fn resolve_executable(pid: Option<u32>, binary: Option<&Path>) -> Result<PathBuf> {
    match (pid, binary) {
        (Some(pid), None) => fs::read_link(format!("/proc/{pid}/exe"))
            .with_context(|| format!("reading executable path for PID {pid}")),
        (None, Some(path)) => Ok(path.to_path_buf()),
        _ => bail!("exactly one of a PID or a binary path must be given"),
    }
}

/// A loaded BPF object with its uprobes attached to one executable.
///
/// Dropping the session detaches the probes.
pub struct ProbeSession {
    object: Object,
    exe_path: PathBuf,
    pid: Option<u32>,
    links: Vec<Link>,
}

impl ProbeSession {
    pub fn load(object_path: &Path, exe_path: PathBuf, pid: Option<u32>) -> Result<ProbeSession> {
        let object = ObjectBuilder::default()
            .open_file(object_path)
            .with_context(|| format!("opening BPF object {}", object_path.display()))?
            .load()
            .context("loading BPF object")?;

        Ok(ProbeSession {
            object,
            exe_path,
            pid,
            links: Vec::new(),
        })
    }

    fn map_handle(&self, name: &str) -> Result<MapHandle> {
        let map = self
            .object
            .maps()
            .find(|m| m.name().to_str() == Some(name))
            .ok_or_else(|| anyhow!("BPF object has no map named {name}"))?;
        MapHandle::try_from(&map).with_context(|| format!("duplicating handle for map {name}"))
    }

    pub fn sampling_map(&self) -> Result<SamplingMap> {
        Ok(SamplingMap::new(self.map_handle(SAMPLING_MAP_NAME)?))
    }

    /// Start draining the object's ringbuffer.
    pub fn ringbuf_source(&self) -> Result<RingbufSource> {
        RingbufSource::spawn(self.map_handle(RINGBUF_MAP_NAME)?)
    }

    /// Attach every runtime uprobe. When a PID was given, probes fire for
    /// that process only; otherwise for every process running the executable.
    pub fn attach(&mut self) -> Result<()> {
        let pid = self.pid.map_or(-1, |p| p as i32);
        for (kind, symbol, prog_name) in RUNTIME_PROBES {
            let prog = self
                .object
                .progs_mut()
                .find(|p| p.name().to_str() == Some(prog_name))
                .ok_or_else(|| anyhow!("BPF object has no program named {prog_name}"))?;
            let link = prog
                .attach_uprobe_with_opts(
                    pid,
                    &self.exe_path,
                    0,
                    UprobeOpts {
                        func_name: symbol.to_string(),
                        ..Default::default()
                    },
                )
                .with_context(|| format!("attaching uprobe at {symbol}"))?;
            self.links.push(link);
            info!(probe = %kind, symbol, "attached uprobe");
        }
        Ok(())
    }
}
