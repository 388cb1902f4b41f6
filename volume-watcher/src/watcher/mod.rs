//! Volume watchers.
//!
//! - `volumes_watcher`: the `Watcher` registry, enabled while this server leads
//! - `volume_watch`: the per-volume task running the unpublish workflow

mod volume_watch;
mod volumes_watcher;

pub use volume_watch::VolumeWatch;
pub use volumes_watcher::Watcher;
