// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Origin detection for packets received on the local stream socket.
//!
//! The peer credentials of a Unix stream connection carry the sender's pid.
//! The pid's cgroup membership names the container it runs in, which becomes
//! the `container_id` tag of every metric on that connection that does not
//! carry its own `|c:` field.

use regex::Regex;
use std::path::PathBuf;
use tracing::trace;
use ustr::Ustr;

const CONTAINER_ID_PATTERN: &str = r"([0-9a-f]{64})|([0-9a-f]{32}-\d+)";

#[derive(Clone, Debug)]
pub struct ContainerResolver {
    proc_root: PathBuf,
    pattern: Regex,
}

impl ContainerResolver {
    pub fn new() -> Self {
        Self::with_proc_root("/proc")
    }

    /// Resolves against an alternate procfs mount, e.g. a host `/proc`
    /// mounted inside the agent's own container.
    #[allow(clippy::unwrap_used)]
    pub fn with_proc_root(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            // constant pattern, always valid
            pattern: Regex::new(CONTAINER_ID_PATTERN).unwrap(),
        }
    }

    /// Container of `pid`, if it runs in one.
    pub fn resolve(&self, pid: i32) -> Option<Ustr> {
        let path = self.proc_root.join(pid.to_string()).join("cgroup");
        match std::fs::read_to_string(&path) {
            Ok(contents) => self.container_id_from_cgroup(&contents),
            Err(e) => {
                trace!("No cgroup for pid {}: {}", pid, e);
                None
            }
        }
    }

    /// Scans cgroup lines (`hierarchy:controllers:path`) for a container id.
    pub fn container_id_from_cgroup(&self, contents: &str) -> Option<Ustr> {
        contents
            .lines()
            .filter_map(|line| line.splitn(3, ':').nth(2))
            .find_map(|path| {
                path.rsplit('/')
                    .find_map(|segment| self.pattern.find(segment))
                    .map(|m| Ustr::from(m.as_str()))
            })
    }
}

impl Default for ContainerResolver {
    fn default() -> Self {
        Self::new()
    }
}
