//! Typed proposers for the built-in domains.
//!
//! A proposer stamps the payload, wraps it in a [`Command`] and either
//! applies it locally (bypass, when the node is not clustered) or submits
//! it to consensus and waits for this node's own apply outcome.

use std::time::Instant;

use tracing::debug;

use super::command::{action, Command, Domain};
use super::consensus::Consensus;
use super::domains::notes::{NoteBulkDelete, NoteCreate, NoteDelete, NoteUpdate};
use super::domains::options::OptionSet;
use super::domains::s3::{S3ConfigDelete, S3ConfigInput};
use super::error::ClusterError;
use super::service::ClusterService;
use crate::db::timestamp;
use crate::metrics::PROPOSE_DURATION_SECONDS;

fn envelope<T: serde::Serialize>(
    domain: Domain,
    action: &str,
    payload: &T,
) -> Result<Command, ClusterError> {
    Command::new(domain, action, payload).map_err(|e| ClusterError::Store(e.into()))
}

impl ClusterService {
    /// Route a command through the bypass path or consensus.
    pub async fn propose(&self, command: Command, bypass: bool) -> Result<(), ClusterError> {
        if bypass {
            self.dispatcher.apply_direct(&command)?;
            return Ok(());
        }
        let consensus = self.consensus().ok_or(ClusterError::NotInitialized)?;
        self.submit(consensus.as_ref(), &command).await
    }

    /// Submit to consensus and surface this node's apply outcome.
    pub(super) async fn submit(
        &self,
        consensus: &dyn Consensus,
        command: &Command,
    ) -> Result<(), ClusterError> {
        let bytes = command
            .encode()
            .map_err(|e| ClusterError::Store(e.into()))?;
        let start = Instant::now();
        let result = consensus.apply(bytes, self.settings.apply_timeout).await;
        metrics::histogram!(
            PROPOSE_DURATION_SECONDS,
            "domain" => command.domain.clone(),
            "action" => command.action.clone(),
        )
        .record(start.elapsed().as_secs_f64());

        let outcome = result.map_err(ClusterError::from_commit)?;
        match outcome.error {
            Some(err) => Err(ClusterError::HandlerFailed(err)),
            None => {
                debug!(domain = %command.domain, action = %command.action, "command committed");
                Ok(())
            }
        }
    }

    pub async fn propose_note_create(
        &self,
        title: &str,
        content: &str,
        bypass: bool,
    ) -> Result<(), ClusterError> {
        let now = timestamp();
        let payload = NoteCreate {
            id: None,
            title: title.to_string(),
            content: content.to_string(),
            created_at: Some(now.clone()),
            updated_at: Some(now),
        };
        let command = envelope(Domain::Note, action::CREATE, &payload)?;
        self.propose(command, bypass).await
    }

    pub async fn propose_note_update(
        &self,
        id: i64,
        title: &str,
        content: &str,
        bypass: bool,
    ) -> Result<(), ClusterError> {
        let payload = NoteUpdate {
            id,
            title: title.to_string(),
            content: content.to_string(),
            updated_at: Some(timestamp()),
        };
        let command = envelope(Domain::Note, action::UPDATE, &payload)?;
        self.propose(command, bypass).await
    }

    pub async fn propose_note_delete(&self, id: i64, bypass: bool) -> Result<(), ClusterError> {
        let command = envelope(Domain::Note, action::DELETE, &NoteDelete { id })?;
        self.propose(command, bypass).await
    }

    pub async fn propose_note_bulk_delete(
        &self,
        ids: &[i64],
        bypass: bool,
    ) -> Result<(), ClusterError> {
        let payload = NoteBulkDelete { ids: ids.to_vec() };
        let command = envelope(Domain::Note, action::BULK_DELETE, &payload)?;
        self.propose(command, bypass).await
    }

    pub async fn propose_option_set(
        &self,
        keyboard_layout: &str,
        bypass: bool,
    ) -> Result<(), ClusterError> {
        let payload = OptionSet {
            keyboard_layout: keyboard_layout.to_string(),
            created_at: None,
            updated_at: Some(timestamp()),
        };
        let command = envelope(Domain::Options, action::SET, &payload)?;
        self.propose(command, bypass).await
    }

    /// Validate an S3 target and replicate it.
    ///
    /// The live permission probe runs once, here on the proposing node,
    /// never inside the apply path.
    pub async fn propose_s3_config(
        &self,
        input: S3ConfigInput,
        bypass: bool,
    ) -> Result<(), ClusterError> {
        if let Some(code) = input.missing_field() {
            return Err(ClusterError::InvalidS3Config(code.to_string()));
        }
        if self.settings.validate_s3_targets {
            crate::storage::s3::validate_target(&input)
                .await
                .map_err(|e| ClusterError::InvalidS3Config(e.to_string()))?;
        }
        let command = envelope(Domain::S3Config, action::CREATE, &input)?;
        self.propose(command, bypass).await
    }

    pub async fn propose_s3_config_delete(&self, id: i64, bypass: bool) -> Result<(), ClusterError> {
        let command = envelope(Domain::S3Config, action::DELETE, &S3ConfigDelete { id })?;
        self.propose(command, bypass).await
    }
}
