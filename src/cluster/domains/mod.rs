//! Built-in replicated domains.
//!
//! Each domain module owns its table: the command handler, the plain
//! mutation functions the handler calls, and the bulk read/insert used by
//! snapshots.

pub mod notes;
pub mod options;
pub mod s3;

use std::sync::Arc;

use super::command::Domain;
use super::registry::HandlerRegistry;

/// Register the handlers for every built-in [`Domain`].
pub fn register_defaults(registry: &HandlerRegistry) {
    registry.register_domain(Domain::Note, Arc::new(notes::NoteHandler));
    registry.register_domain(Domain::S3Config, Arc::new(s3::S3ConfigHandler));
    registry.register_domain(Domain::Options, Arc::new(options::OptionsHandler));
}
