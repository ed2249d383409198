//! Self-update: manifest checks, verified downloads, and the hand-off to
//! a platform install script.
//!
//! | Module      | Purpose                                         |
//! |-------------|-------------------------------------------------|
//! | `status`    | State machine values and the release manifest   |
//! | `version`   | Dotted version comparison                       |
//! | `source`    | Manifest/package source trait and HTTP client   |
//! | `manager`   | The update state machine                        |
//! | `installer` | Backup, script rendering, elevated launch       |

pub mod installer;
pub mod manager;
pub mod source;
pub mod status;
pub mod version;

pub use installer::{InstallLayout, InstallPlan, Installer, LaunchContext, Platform, ScriptInstaller};
pub use manager::{UpdateConfig, UpdateEvent, UpdateManager};
pub use source::{HttpUpdateSource, ManifestQuery, UpdateSource};
pub use status::{UpdateInfo, UpdateState, UpdateStatus};
