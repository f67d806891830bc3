//! duorec - unattended dual-camera recording appliance
//!
//! Turns scheduled bookings into time-accurate dual-camera recordings,
//! stitches the two streams into a single panoramic artifact, decorates it
//! with branding, and ships it to object storage while updating the remote
//! booking store.
//!
//! Two long-lived processes share this library through a filesystem
//! workspace: the supervisor (scheduler + capture + merge) and the
//! post-processor (branding + upload). Sentinel marker files couple them so
//! the pipeline survives crashes of either side.

pub mod booking;
pub mod capture;
pub mod cli;
pub mod config;
pub mod logging;
pub mod media;
pub mod merge;
pub mod postprocess;
pub mod retry;
pub mod store;
pub mod supervisor;
pub mod upload;
pub mod workspace;
