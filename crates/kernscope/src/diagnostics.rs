//! Per-run diagnostics.
//!
//! Every traversal and derivation takes a [`Diagnostics`] handle instead of
//! logging to a global stream, so corruption events can be attributed to the
//! run and process they came from. Events are kept for the caller and also
//! emitted as `tracing` events carrying `run` and `scope` fields.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// A list or tree walk ended early.
    CorruptList,
    /// A per-process layer could not be built.
    LayerDerivation,
    /// A field could not be read and was reported as absent.
    FieldUnavailable,
    /// A section was left out of a reconstruction.
    SectionOmitted,
    ProcessSkipped,
    RegionSkipped,
}

impl DiagnosticKind {
    fn is_warning(self) -> bool {
        matches!(
            self,
            DiagnosticKind::CorruptList | DiagnosticKind::LayerDerivation | DiagnosticKind::ProcessSkipped
        )
    }
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DiagnosticKind::CorruptList => "corrupt_list",
            DiagnosticKind::LayerDerivation => "layer_derivation",
            DiagnosticKind::FieldUnavailable => "field_unavailable",
            DiagnosticKind::SectionOmitted => "section_omitted",
            DiagnosticKind::ProcessSkipped => "process_skipped",
            DiagnosticKind::RegionSkipped => "region_skipped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticEvent {
    pub kind: DiagnosticKind,
    pub scope: Option<String>,
    pub address: Option<u64>,
    pub message: String,
    pub recorded_at: DateTime<Utc>,
}

/// Cloneable event collector for one run.
///
/// Clones and [`Diagnostics::scoped`] children share the same event list.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    run_id: String,
    scope: Option<String>,
    events: Arc<Mutex<Vec<DiagnosticEvent>>>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new()
    }
}

impl Diagnostics {
    pub fn new() -> Self {
        Diagnostics {
            run_id: Uuid::new_v4().to_string(),
            scope: None,
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    /// A handle recording into the same run under a nested scope.
    pub fn scoped(&self, scope: impl fmt::Display) -> Diagnostics {
        let scope = match &self.scope {
            Some(parent) => format!("{}/{}", parent, scope),
            None => scope.to_string(),
        };
        Diagnostics {
            run_id: self.run_id.clone(),
            scope: Some(scope),
            events: self.events.clone(),
        }
    }

    pub fn record(&self, kind: DiagnosticKind, address: Option<u64>, message: impl Into<String>) {
        let message = message.into();
        let scope = self.scope.as_deref().unwrap_or("-");
        let addr = address.map(|a| format!("{:#x}", a)).unwrap_or_default();
        if kind.is_warning() {
            warn!(run = %self.run_id, scope, kind = %kind, address = %addr, "{}", message);
        } else {
            debug!(run = %self.run_id, scope, kind = %kind, address = %addr, "{}", message);
        }
        self.events.lock().push(DiagnosticEvent {
            kind,
            scope: self.scope.clone(),
            address,
            message,
            recorded_at: Utc::now(),
        });
    }

    /// Snapshot of all events recorded so far in this run.
    pub fn events(&self) -> Vec<DiagnosticEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, kind: DiagnosticKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind == kind).count()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}
