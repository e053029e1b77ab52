//! Transcript → clinical note pipeline (consumer side).
//!
//! The hub does not build notes itself. It hands a finalized transcript to a
//! [`NoteTransformer`], checks the medication names the draft mentions
//! against a [`MedicationLookup`], and relays the outcome. One attempt per
//! transcript, bounded by a deadline; failure degrades instead of retrying.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;

use crate::protocol::{MedicationCheck, NoteResult, NoteSections};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NoteError {
    #[error("note service unavailable")]
    Unavailable,
    #[error("note service failed: {0}")]
    Failed(String),
}

/// Output of the transformer before medication checks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DraftNote {
    pub sections: NoteSections,
    /// Medication names mentioned in the note, as written.
    pub medications: Vec<String>,
}

/// Turns a finalized transcript into a structured note.
pub trait NoteTransformer: Send + Sync {
    fn transform<'a>(&'a self, transcript: &'a str) -> BoxFuture<'a, Result<DraftNote, NoteError>>;
}

/// Answers whether a medication name exists.
pub trait MedicationLookup: Send + Sync {
    fn exists<'a>(&'a self, name: &'a str) -> BoxFuture<'a, bool>;
}

/// Default transformer when no note service is wired in.
pub struct UnavailableTransformer;

impl NoteTransformer for UnavailableTransformer {
    fn transform<'a>(&'a self, _transcript: &'a str) -> BoxFuture<'a, Result<DraftNote, NoteError>> {
        Box::pin(async { Err(NoteError::Unavailable) })
    }
}

/// Default lookup: nothing is known.
pub struct NoMedicationLookup;

impl MedicationLookup for NoMedicationLookup {
    fn exists<'a>(&'a self, _name: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async { false })
    }
}

pub struct NotePipeline {
    transformer: Arc<dyn NoteTransformer>,
    lookup: Arc<dyn MedicationLookup>,
    timeout: Duration,
}

impl NotePipeline {
    pub fn new(
        transformer: Arc<dyn NoteTransformer>,
        lookup: Arc<dyn MedicationLookup>,
        timeout: Duration,
    ) -> Self {
        Self {
            transformer,
            lookup,
            timeout,
        }
    }

    pub fn unavailable(timeout: Duration) -> Self {
        Self::new(Arc::new(UnavailableTransformer), Arc::new(NoMedicationLookup), timeout)
    }

    /// Transform `transcript` once. Never fails; problems become
    /// [`NoteResult::Degraded`].
    pub async fn process(&self, transcript: &str) -> NoteResult {
        let draft = match tokio::time::timeout(self.timeout, self.transformer.transform(transcript)).await {
            Ok(Ok(draft)) => draft,
            Ok(Err(e)) => {
                log::warn!("Note transformation failed: {e}");
                return NoteResult::Degraded {
                    reason: e.to_string(),
                };
            }
            Err(_) => {
                log::warn!("Note transformation timed out after {:?}", self.timeout);
                return NoteResult::Degraded {
                    reason: format!("timed out after {} ms", self.timeout.as_millis()),
                };
            }
        };

        let mut medications: Vec<MedicationCheck> = Vec::new();
        for name in draft.medications {
            let name = name.trim();
            if name.is_empty() || medications.iter().any(|m| m.name.eq_ignore_ascii_case(name)) {
                continue;
            }
            let known = self.lookup.exists(name).await;
            medications.push(MedicationCheck {
                name: name.to_string(),
                known,
            });
        }

        NoteResult::Ready {
            sections: draft.sections,
            medications,
        }
    }
}
