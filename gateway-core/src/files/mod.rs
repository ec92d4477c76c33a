//! File manager: roots, change watcher, metadata pipeline, and the
//! shared print-state contract (spec §4.10-§4.13).

pub mod metadata;
pub mod print_state;
pub mod roots;
pub mod watcher;

pub use metadata::{ExternalExtractor, GcodeExtractor, MetadataCache, MetadataRecord};
pub use print_state::{derive_events, derive_host_loss_event, FinishReason, PrintEvent, PrintState, PrintStatsSnapshot};
pub use roots::{AccessMode, DirectoryListing, FileRoot, FileRootsManager, NoHostSession, PrintStatusProvider};
pub use watcher::{ChangeEvent, ChangeWatcher, WatchGuard};
