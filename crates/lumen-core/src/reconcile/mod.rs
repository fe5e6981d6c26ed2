//! Assignment of execution outputs to display slots.
//!
//! Re-running a source should put each new output where the matching old one
//! was shown. Prior slots are walked with a cursor in display order (top to
//! bottom, then left to right):
//!
//! 1. the first slot at or after the cursor with the same kind is reused;
//! 2. otherwise the slot under the cursor is reused whatever its kind;
//! 3. otherwise a new slot is stacked beside the source.
//!
//! Slots that end up unused are returned for removal. The result depends only
//! on the inputs, so the same kind sequence lands in the same places every run.

mod bindings;

pub use bindings::BindingStore;

use serde::{Deserialize, Serialize};

use crate::config::LayoutConfig;
use crate::model::{Artifact, ArtifactKind};

/// Top-left corner on the canvas.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

/// Where one artifact of a source is displayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slot {
    /// Canvas handle of the element showing this slot; `None` until the
    /// canvas (or a [`BindingStore`]) names a freshly allocated slot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub position: Position,
    pub size: Size,
    pub artifact_kind: ArtifactKind,
}

impl Slot {
    pub fn new(position: Position, size: Size, artifact_kind: ArtifactKind) -> Self {
        Self {
            id: None,
            position,
            size,
            artifact_kind,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    fn bottom(&self) -> f64 {
        self.position.y + self.size.height
    }

    fn has_valid_geometry(&self) -> bool {
        [self.position.x, self.position.y, self.size.width, self.size.height]
            .iter()
            .all(|v| v.is_finite())
            && self.size.width > 0.0
            && self.size.height > 0.0
    }

    /// Whether two slots cover a common area.
    pub fn overlaps(&self, other: &Slot) -> bool {
        self.position.x < other.position.x + other.size.width
            && other.position.x < self.position.x + self.size.width
            && self.position.y < other.bottom()
            && other.position.y < self.bottom()
    }
}

/// Frame of the source element whose outputs are being placed.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Anchor {
    pub position: Position,
    pub size: Size,
}

/// One artifact bound to a slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub artifact: Artifact,
    pub slot: Slot,
    /// True when the slot was allocated in this run.
    pub is_new: bool,
}

/// Outcome of reconciling one run of a source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reconciliation {
    pub assignments: Vec<Assignment>,
    /// Prior slots no longer used; their elements should be discarded.
    pub removed: Vec<Slot>,
}

impl Reconciliation {
    pub fn reused_count(&self) -> usize {
        self.assignments.iter().filter(|a| !a.is_new).count()
    }

    pub fn new_count(&self) -> usize {
        self.assignments.iter().filter(|a| a.is_new).count()
    }
}

/// Reduce a run's artifacts to the ones that get slots.
///
/// An error replaces every other output; an empty run shows a success marker.
pub fn normalize_artifacts(artifacts: &[Artifact]) -> Vec<Artifact> {
    if let Some(error) = artifacts.iter().find(|a| a.kind == ArtifactKind::Error) {
        return vec![error.clone()];
    }
    if artifacts.is_empty() {
        return vec![Artifact::success()];
    }
    artifacts.to_vec()
}

/// Sort slots into display order (top to bottom, then left to right).
pub fn sort_slots(slots: &mut [Slot]) {
    slots.sort_by(|a, b| {
        a.position
            .y
            .total_cmp(&b.position.y)
            .then(a.position.x.total_cmp(&b.position.x))
    });
}

/// Computes slot assignments with a fixed layout.
#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    layout: LayoutConfig,
}

impl Reconciler {
    pub fn new(layout: LayoutConfig) -> Self {
        Self { layout }
    }

    /// Default size of a newly allocated slot for `kind`.
    pub fn default_size(&self, kind: ArtifactKind) -> Size {
        let (width, height) = match kind {
            ArtifactKind::Text => self.layout.text_size,
            ArtifactKind::Image => self.layout.image_size,
            ArtifactKind::Error => self.layout.error_size,
            ArtifactKind::Success => self.layout.success_size,
        };
        Size { width, height }
    }

    /// Match `artifacts` of a new run against the slots shown for the previous one.
    pub fn reconcile(&self, anchor: &Anchor, prior: &[Slot], artifacts: &[Artifact]) -> Reconciliation {
        let artifacts = normalize_artifacts(artifacts);
        let mut prior = prior.to_vec();
        sort_slots(&mut prior);

        let mut assignments: Vec<Assignment> = Vec::with_capacity(artifacts.len());
        let mut removed = Vec::new();
        let mut cursor = 0;

        for artifact in artifacts {
            let matched = prior[cursor..]
                .iter()
                .position(|slot| slot.artifact_kind == artifact.kind)
                .map(|offset| cursor + offset);

            let reused = match matched {
                Some(index) => {
                    // Slots jumped over by the kind match are not shown any more.
                    removed.extend(prior[cursor..index].iter().cloned());
                    cursor = index + 1;
                    Some(prior[index].clone())
                }
                None if cursor < prior.len() => {
                    cursor += 1;
                    Some(prior[cursor - 1].clone())
                }
                None => None,
            };

            let (slot, is_new) = match reused {
                Some(slot) if slot.has_valid_geometry() => (
                    Slot {
                        artifact_kind: artifact.kind,
                        ..slot
                    },
                    false,
                ),
                Some(slot) => {
                    tracing::warn!(
                        "Reconciliation inconsistency: slot {:?} has unusable geometry {:?}/{:?}, allocating a default slot",
                        slot.id,
                        slot.position,
                        slot.size
                    );
                    removed.push(slot);
                    (self.fresh_slot(anchor, assignments.last(), artifact.kind), true)
                }
                None => (self.fresh_slot(anchor, assignments.last(), artifact.kind), true),
            };

            assignments.push(Assignment { artifact, slot, is_new });
        }

        removed.extend(prior[cursor..].iter().cloned());

        Reconciliation { assignments, removed }
    }

    /// A slot right of the source, under the previous output of this run.
    fn fresh_slot(&self, anchor: &Anchor, previous: Option<&Assignment>, kind: ArtifactKind) -> Slot {
        let gap = self.layout.gap;
        let x = anchor.position.x + anchor.size.width + gap;
        let y = match previous {
            Some(prev) => prev.slot.bottom() + gap,
            None => anchor.position.y,
        };
        Slot::new(Position { x, y }, self.default_size(kind), kind)
    }
}
