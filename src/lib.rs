//! # SpaceSync
//!
//! An incremental sync engine that mirrors wiki spaces into a remote
//! knowledge-base index.
//!
//! SpaceSync lists a space's pages and attachments, diffs the listing
//! against the state recorded by the previous pass, and applies only the
//! minimal set of upload/delete operations needed to bring the destination
//! index up to date — without re-processing unchanged content and without
//! leaving stale or duplicated documents behind.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐    ┌────────────┐    ┌───────────────┐
//! │ Source wiki  │──▶│ Reconciler │──▶│  Knowledge     │
//! │ pages + atts │    │ diff+apply │    │  base index   │
//! └──────────────┘    └─────┬──────┘    └───────────────┘
//!                           │
//!                     ┌─────▼──────┐
//!                     │ JSON state │
//!                     │ per space  │
//!                     └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! ssync verify                  # check source credentials
//! ssync sync ENG                # reconcile space ENG
//! ssync sync ENG --dry-run      # show the pending diff
//! ssync retrieve ENG "rollout"  # query the destination index
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Entity records, snapshots, pass reports |
//! | [`error`] | Error taxonomy |
//! | [`source`] | Wiki source client (paginated REST) |
//! | [`normalize`] | Page body → plain text |
//! | [`state`] | Durable per-collection sync state |
//! | [`diff`] | Snapshot diffing |
//! | [`gateway`] | Destination knowledge-base client |
//! | [`extract`] | Attachment classification and extraction |
//! | [`reconcile`] | Sync-pass orchestration |

pub mod config;
pub mod diff;
pub mod error;
pub mod extract;
pub mod gateway;
pub mod models;
pub mod normalize;
pub mod reconcile;
pub mod source;
pub mod state;
