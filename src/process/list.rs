//! Enumerating candidate target processes for the attach dialog.

use serde::Serialize;
use sysinfo::{ProcessesToUpdate, System};

/// One row of the process picker.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessListing {
    pub pid: u32,
    pub name: String,
}

/// Lists every process on the system, sorted by name then pid.
pub fn system_processes() -> Vec<ProcessListing> {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    let mut listings: Vec<ProcessListing> = system
        .processes()
        .iter()
        .map(|(pid, process)| ProcessListing {
            pid: pid.as_u32(),
            name: process.name().to_string_lossy().into_owned(),
        })
        .collect();
    listings.sort_by(|a, b| a.name.cmp(&b.name).then(a.pid.cmp(&b.pid)));
    listings
}
