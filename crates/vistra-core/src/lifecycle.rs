//! Resource lifecycle status tracking.
//!
//! Every engine-owned resource carries an [`ObjectStatus`] tag describing
//! where it is in its create/update/destroy cycle. Types opt in by
//! implementing [`Lifecycle`] over an embedded status field (composition,
//! not inheritance).

/// Lifecycle status of an engine-owned resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum ObjectStatus {
    /// No initialization has happened yet.
    #[default]
    Uninitialized,
    /// Host-side initialization done, no device objects yet.
    Init,
    /// Device objects created and usable.
    Created,
    /// Device objects must be destroyed and created again (e.g. resize).
    NeedRecreate,
    /// Host-side contents changed, device copy is stale.
    NeedUpdate,
    /// Marked for destruction at the next safe point.
    NeedDestroy,
    /// Unrecoverable; the resource must not be used again.
    Invalid,
    /// Device objects destroyed.
    Destroyed,
}

/// Status accessors shared by all engine resources.
pub trait Lifecycle {
    /// Current lifecycle status.
    fn status(&self) -> ObjectStatus;

    /// Overwrite the lifecycle status.
    fn set_status(&mut self, status: ObjectStatus);

    /// Whether the resource currently holds live device objects.
    ///
    /// A resource flagged for recreate/update/destroy is still created: its
    /// device objects exist until they are actually torn down.
    fn is_created(&self) -> bool {
        matches!(
            self.status(),
            ObjectStatus::Created
                | ObjectStatus::NeedRecreate
                | ObjectStatus::NeedUpdate
                | ObjectStatus::NeedDestroy
        )
    }

    /// Mark the resource as created.
    fn mark_created(&mut self) {
        self.set_status(ObjectStatus::Created);
    }

    /// Mark the resource as destroyed.
    fn mark_destroyed(&mut self) {
        self.set_status(ObjectStatus::Destroyed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy {
        status: ObjectStatus,
    }

    impl Lifecycle for Dummy {
        fn status(&self) -> ObjectStatus {
            self.status
        }

        fn set_status(&mut self, status: ObjectStatus) {
            self.status = status;
        }
    }

    #[test]
    fn created_covers_pending_states() {
        let mut d = Dummy {
            status: ObjectStatus::Uninitialized,
        };
        assert!(!d.is_created());

        d.mark_created();
        assert!(d.is_created());

        d.set_status(ObjectStatus::NeedRecreate);
        assert!(d.is_created());

        d.mark_destroyed();
        assert!(!d.is_created());
        assert_eq!(d.status(), ObjectStatus::Destroyed);
    }
}
