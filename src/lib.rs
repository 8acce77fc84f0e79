//! Build pipeline for persistent live-OS ISO images.
//!
//! liveforge stages a Debian-family root filesystem inside a privileged
//! chroot, installs software into it, and packages the result into a
//! hybrid BIOS+EFI bootable ISO carrying a writable persistence volume.
//! The parts with real failure-mode complexity live here:
//!
//! - **Mount tracking** - every chroot mount is recorded and unwound in
//!   strict reverse order on every exit path, with a residue sweep for
//!   leftovers of crashed runs
//! - **Process eviction** - holders of the working tree are terminated
//!   before unmounts and deletions so cleanup cannot hang
//! - **Staged pipeline** - base staging, provisioning, configuration,
//!   and persistence run as ordered, precondition-checked stages
//! - **Artifact assembly** - squashfs compression, kernel selection,
//!   GRUB boot images, and hybrid ISO creation from the finished root
//!
//! # Architecture
//!
//! ```text
//! Pipeline (pipeline::Pipeline)
//!     │
//!     ├── Owns: MountTracker, Evictor, StageRunner, Assembler
//!     ├── Drives: verify → reset → stages → unwind → assemble → publish
//!     └── Guarantees: full mount unwind on success, failure, and cancel
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::path::Path;
//! use liveforge::config::BuildConfig;
//! use liveforge::pipeline::Pipeline;
//!
//! let config = BuildConfig::load(Path::new("build.toml"))?;
//! let artifact = Pipeline::new(config)?.run()?;
//! println!("ISO at {}", artifact.iso.display());
//! ```

pub mod artifact;
pub mod config;
pub mod error;
pub mod evict;
pub mod mounts;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod provision;
pub mod stage;
pub mod workspace;

pub use config::BuildConfig;
pub use error::BuildError;
pub use pipeline::{Pipeline, PipelineState};
