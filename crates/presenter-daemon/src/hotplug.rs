//! Hot-plug monitoring
//!
//! Watches the device directories with inotify for newly created `event*`
//! and `hidraw*` nodes. A fresh node is often not usable right away (udev has
//! not applied permissions or filled its database yet), so opening it goes
//! through [`open_hotplugged`], which retries with linear backoff and gives
//! up silently.
//!
//! Removal is not watched: a vanished device surfaces as a read error on its
//! open sub-devices.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify, WatchDescriptor};
use tokio::io::unix::AsyncFd;

use crate::connection::SubDeviceConnection;
use crate::device::{
    assemble_scan, interface_kind_for, probe_node, InterfaceKind, ScannedDevice, SupportedDevices,
};

/// Directories holding evdev and hidraw nodes
pub const WATCHED_DIRS: &[&str] = &["/dev/input", "/dev"];

/// Open attempts for a hotplugged node
pub const RETRY_ATTEMPTS: u32 = 5;

/// Backoff unit; attempt `n` waits `n * RETRY_STEP` first
pub const RETRY_STEP: Duration = Duration::from_millis(100);

// ============================================================================
// Retry
// ============================================================================

/// Outcome of one open attempt
#[derive(Debug)]
pub enum Attempt<T> {
    Ready(T),
    /// Not a node we want; stop without retrying
    Skip,
    /// Not ready yet
    Retry(String),
}

/// Run `attempt` until it succeeds, skips or runs out of attempts
///
/// The first attempt runs immediately; attempt `n` (counting from 0) is
/// preceded by a sleep of `n * step`.
pub async fn retry_with_backoff<T>(
    attempts: u32,
    step: Duration,
    mut attempt: impl FnMut() -> Attempt<T>,
) -> Option<T> {
    for n in 0..attempts {
        if n > 0 {
            tokio::time::sleep(step * n).await;
        }
        match attempt() {
            Attempt::Ready(value) => return Some(value),
            Attempt::Skip => return None,
            Attempt::Retry(reason) => {
                tracing::trace!(attempt = n + 1, reason = %reason, "Node not ready");
            }
        }
    }
    None
}

/// Probe and open a node that just appeared
///
/// Returns the device it belongs to (with this node as its only sub-device)
/// and the opened sub-device, or `None` if the node is not a supported
/// device or never became openable.
pub async fn open_hotplugged(
    devnode: PathBuf,
    supported: SupportedDevices,
    grab: bool,
) -> Option<(ScannedDevice, SubDeviceConnection)> {
    let is_hidraw = devnode
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(interface_kind_for)
        == Some(InterfaceKind::RawProtocol);
    if is_hidraw {
        // Event nodes of the same interface show up shortly after hidraw
        tokio::time::sleep(RETRY_STEP).await;
    }

    let opened = retry_with_backoff(RETRY_ATTEMPTS, RETRY_STEP, || {
        let node = match probe_node(&devnode) {
            Ok(Some(node)) => node,
            Ok(None) => return Attempt::Skip,
            Err(e) => return Attempt::Retry(e.to_string()),
        };
        let Some(device) = assemble_scan(vec![node], Vec::new(), &supported)
            .devices
            .into_iter()
            .next()
        else {
            return Attempt::Skip;
        };
        let Some(descriptor) = device.sub_devices.first() else {
            return Attempt::Skip;
        };
        match SubDeviceConnection::open(descriptor, &device.identity, device.bus, grab) {
            Ok(connection) => Attempt::Ready((device, connection)),
            Err(e) if e.is_transient() => Attempt::Retry(e.to_string()),
            Err(e) => {
                tracing::debug!(path = %devnode.display(), error = %e, "Ignoring hotplugged node");
                Attempt::Skip
            }
        }
    })
    .await;

    if opened.is_none() {
        tracing::debug!(path = %devnode.display(), "Hotplugged node not used");
    }
    opened
}

// ============================================================================
// inotify
// ============================================================================

struct InotifyFd(Inotify);

impl AsRawFd for InotifyFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_fd().as_raw_fd()
    }
}

/// Reports device nodes created in the watched directories
pub struct HotplugMonitor {
    fd: AsyncFd<InotifyFd>,
    dirs: HashMap<WatchDescriptor, PathBuf>,
}

impl HotplugMonitor {
    /// Watch [`WATCHED_DIRS`]
    pub fn new() -> io::Result<Self> {
        Self::watching(WATCHED_DIRS.iter().map(Path::new))
    }

    /// Watch `dirs`; directories that cannot be watched are skipped
    ///
    /// # Errors
    ///
    /// Fails if inotify is unavailable or none of `dirs` could be watched.
    pub fn watching<'a>(dirs: impl IntoIterator<Item = &'a Path>) -> io::Result<Self> {
        let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)?;

        let mut watched = HashMap::new();
        for dir in dirs {
            match inotify.add_watch(dir, AddWatchFlags::IN_CREATE) {
                Ok(wd) => {
                    tracing::debug!(dir = %dir.display(), "Watching for new device nodes");
                    watched.insert(wd, dir.to_path_buf());
                }
                Err(e) => tracing::warn!(dir = %dir.display(), error = %e, "Cannot watch directory"),
            }
        }
        if watched.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "no device directory could be watched",
            ));
        }

        Ok(Self {
            fd: AsyncFd::new(InotifyFd(inotify))?,
            dirs: watched,
        })
    }

    /// Wait for newly created `event*`/`hidraw*` nodes
    pub async fn next_created(&mut self) -> io::Result<Vec<PathBuf>> {
        loop {
            let mut guard = self.fd.readable().await?;
            let events = match guard
                .try_io(|inner| inner.get_ref().0.read_events().map_err(io::Error::from))
            {
                Ok(result) => result?,
                Err(_would_block) => continue,
            };

            let created: Vec<PathBuf> = events
                .into_iter()
                .filter_map(|event| {
                    let dir = self.dirs.get(&event.wd)?;
                    let name = event.name?;
                    let name = name.to_str()?;
                    interface_kind_for(name)?;
                    Some(dir.join(name))
                })
                .collect();
            if !created.is_empty() {
                return Ok(created);
            }
        }
    }
}
