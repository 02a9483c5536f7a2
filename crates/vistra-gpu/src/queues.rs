//! Logical queue role assignment.
//!
//! Maps the engine's logical queue roles onto the physical queue families a
//! device exposes. The selection is a pure function over probed
//! capabilities, so it runs (and is tested) without a device.

use crate::error::{GpuError, Result};
use ash::vk;

/// Logical roles the engine submits work under.
///
/// The discriminant order is the assignment priority order for non-main
/// roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum QueueRole {
    /// Graphics + compute queue; always present, always assigned first.
    Main = 0,
    /// Dedicated async compute.
    Compute = 1,
    /// Dedicated DMA transfer.
    Transfer = 2,
    /// Video encode (screencasts).
    VideoEncode = 3,
    /// Video decode.
    VideoDecode = 4,
}

impl QueueRole {
    /// All roles, in assignment priority order.
    pub const ALL: [Self; 5] = [
        Self::Main,
        Self::Compute,
        Self::Transfer,
        Self::VideoEncode,
        Self::VideoDecode,
    ];

    /// Capability bits that characterize the role, used as the tie-break
    /// target when several families qualify.
    const fn mask(self) -> vk::QueueFlags {
        match self {
            Self::Main => vk::QueueFlags::from_raw(
                vk::QueueFlags::GRAPHICS.as_raw() | vk::QueueFlags::COMPUTE.as_raw(),
            ),
            Self::Compute => vk::QueueFlags::COMPUTE,
            Self::Transfer => vk::QueueFlags::TRANSFER,
            Self::VideoEncode => vk::QueueFlags::VIDEO_ENCODE_KHR,
            Self::VideoDecode => vk::QueueFlags::VIDEO_DECODE_KHR,
        }
    }

    /// Whether a family with the given capability flags can serve this role.
    pub fn supported_by(self, flags: vk::QueueFlags) -> bool {
        match self {
            Self::Main => {
                flags.contains(vk::QueueFlags::GRAPHICS) && flags.contains(vk::QueueFlags::COMPUTE)
            }
            Self::Compute => flags.contains(vk::QueueFlags::COMPUTE),
            // Any queue that supports graphics or compute supports transfer
            // per the Vulkan spec, even if the transfer bit is not set.
            Self::Transfer => flags.intersects(
                vk::QueueFlags::TRANSFER | vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
            ),
            Self::VideoEncode => flags.contains(vk::QueueFlags::VIDEO_ENCODE_KHR),
            Self::VideoDecode => flags.contains(vk::QueueFlags::VIDEO_DECODE_KHR),
        }
    }
}

/// Capabilities of one physical queue family, immutable once probed.
#[derive(Debug, Clone, Copy)]
pub struct QueueFamilyCaps {
    /// Capability bits of the family.
    pub flags: vk::QueueFlags,
    /// Number of queues the family exposes.
    pub queue_count: u32,
}

impl QueueFamilyCaps {
    /// Probe all queue families of a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn probe(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
    ) -> Vec<Self> {
        let families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        families
            .iter()
            .map(|props| Self {
                flags: props.queue_flags,
                queue_count: props.queue_count,
            })
            .collect()
    }
}

/// One role's binding to a physical family and queue index.
#[derive(Debug, Clone, Copy)]
pub struct QueueAssignment {
    /// Physical queue family index.
    pub family_index: u32,
    /// Queue index within the family.
    pub queue_index: u32,
    /// Capability flags of the family.
    pub flags: vk::QueueFlags,
    /// Whether this is the main (graphics + compute) binding.
    pub is_main: bool,
}

impl QueueAssignment {
    /// Whether this assignment's family can serve the given role.
    pub fn supports(&self, role: QueueRole) -> bool {
        role.supported_by(self.flags)
    }
}

/// Role to physical-queue mapping for one device.
#[derive(Debug, Clone)]
pub struct QueueSelection {
    assignments: [Option<QueueAssignment>; QueueRole::ALL.len()],
}

impl QueueSelection {
    /// Assign logical roles to the given queue families.
    ///
    /// MAIN goes to the first family supporting graphics + compute; this is
    /// required. Every other role gets the most specialized qualifying
    /// non-main family (fewest capability bits, then fewest bits away from
    /// the role's own mask, then lowest index), consuming one queue per
    /// assignment, or stays unset when no family qualifies.
    pub fn assign(families: &[QueueFamilyCaps]) -> Result<Self> {
        let main_family = families
            .iter()
            .position(|f| QueueRole::Main.supported_by(f.flags) && f.queue_count > 0)
            .ok_or_else(|| {
                GpuError::Configuration(
                    "no queue family supports both graphics and compute".into(),
                )
            })?;

        let mut assignments = [None; QueueRole::ALL.len()];
        assignments[QueueRole::Main as usize] = Some(QueueAssignment {
            family_index: main_family as u32,
            queue_index: 0,
            flags: families[main_family].flags,
            is_main: true,
        });

        // Queues already claimed per family; MAIN holds queue 0 of its own.
        let mut used = vec![0_u32; families.len()];
        used[main_family] = 1;

        for role in [
            QueueRole::Compute,
            QueueRole::Transfer,
            QueueRole::VideoEncode,
            QueueRole::VideoDecode,
        ] {
            let mut best: Option<usize> = None;
            let mut best_bits = u32::MAX;
            let mut best_distance = u32::MAX;

            for (i, family) in families.iter().enumerate() {
                if i == main_family || used[i] >= family.queue_count {
                    continue;
                }
                if !role.supported_by(family.flags) {
                    continue;
                }

                let bits = family.flags.as_raw().count_ones();
                let distance = (family.flags.as_raw() ^ role.mask().as_raw()).count_ones();
                if bits < best_bits || (bits == best_bits && distance < best_distance) {
                    best_bits = bits;
                    best_distance = distance;
                    best = Some(i);
                }
            }

            if let Some(family) = best {
                assignments[role as usize] = Some(QueueAssignment {
                    family_index: family as u32,
                    queue_index: used[family],
                    flags: families[family].flags,
                    is_main: false,
                });
                used[family] += 1;
            } else {
                tracing::trace!(?role, "no dedicated queue family for role");
            }
        }

        let selection = Self { assignments };
        tracing::debug!("queue selection: {selection}");
        Ok(selection)
    }

    /// The main (graphics + compute) assignment.
    pub fn main(&self) -> QueueAssignment {
        self.assignments[QueueRole::Main as usize].expect("main queue is always assigned")
    }

    /// The dedicated assignment for a role, if one was made.
    pub const fn dedicated(&self, role: QueueRole) -> Option<QueueAssignment> {
        self.assignments[role as usize]
    }

    /// Resolve a role to a usable assignment.
    ///
    /// Prefers the role's dedicated assignment, then any other non-main
    /// assignment whose family supports the role, then MAIN if its flags
    /// satisfy the role, and finally `None`.
    pub fn queue_from_role(&self, role: QueueRole) -> Option<QueueAssignment> {
        if role == QueueRole::Main {
            return Some(self.main());
        }

        if let Some(assignment) = self.assignments[role as usize] {
            return Some(assignment);
        }

        for assignment in self.assignments.iter().flatten() {
            if !assignment.is_main && assignment.supports(role) {
                return Some(*assignment);
            }
        }

        let main = self.main();
        if main.supports(role) {
            return Some(main);
        }

        tracing::debug!(?role, "no queue supports role");
        None
    }

    /// Families used by at least one role, with the number of queues to
    /// request from each. Suitable for building `DeviceQueueCreateInfo`s.
    pub fn family_queue_counts(&self) -> Vec<(u32, u32)> {
        let mut counts: Vec<(u32, u32)> = Vec::new();
        for assignment in self.assignments.iter().flatten() {
            let needed = assignment.queue_index + 1;
            match counts.iter_mut().find(|(f, _)| *f == assignment.family_index) {
                Some((_, n)) => *n = (*n).max(needed),
                None => counts.push((assignment.family_index, needed)),
            }
        }
        counts
    }

    /// Iterate over the assigned roles.
    pub fn iter(&self) -> impl Iterator<Item = (QueueRole, QueueAssignment)> + '_ {
        QueueRole::ALL
            .iter()
            .filter_map(|&role| self.assignments[role as usize].map(|a| (role, a)))
    }
}

impl std::fmt::Display for QueueSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (role, assignment) in self.iter() {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            write!(
                f,
                "{role:?} -> family {} queue {} [{}]",
                assignment.family_index,
                assignment.queue_index,
                flags_label(assignment.flags),
            )?;
        }
        Ok(())
    }
}

/// Human-readable label for a set of queue capability flags.
pub fn flags_label(flags: vk::QueueFlags) -> String {
    let names = [
        (vk::QueueFlags::GRAPHICS, "GRAPHICS"),
        (vk::QueueFlags::COMPUTE, "COMPUTE"),
        (vk::QueueFlags::TRANSFER, "TRANSFER"),
        (vk::QueueFlags::SPARSE_BINDING, "SPARSE_BINDING"),
        (vk::QueueFlags::PROTECTED, "PROTECTED"),
        (vk::QueueFlags::VIDEO_DECODE_KHR, "VIDEO_DECODE"),
        (vk::QueueFlags::VIDEO_ENCODE_KHR, "VIDEO_ENCODE"),
    ];

    let label = names
        .iter()
        .filter(|(bit, _)| flags.contains(*bit))
        .map(|(_, name)| *name)
        .collect::<Vec<_>>()
        .join("|");

    if label.is_empty() {
        "NONE".to_string()
    } else {
        label
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags, queue_count: u32) -> QueueFamilyCaps {
        QueueFamilyCaps { flags, queue_count }
    }

    const GC: vk::QueueFlags = vk::QueueFlags::from_raw(
        vk::QueueFlags::GRAPHICS.as_raw() | vk::QueueFlags::COMPUTE.as_raw(),
    );

    #[test]
    fn main_requires_graphics_and_compute() {
        let err = QueueSelection::assign(&[family(vk::QueueFlags::TRANSFER, 1)]).unwrap_err();
        assert!(matches!(err, GpuError::Configuration(_)));
    }

    #[test]
    fn main_is_first_graphics_compute_family() {
        let families = [
            family(vk::QueueFlags::TRANSFER, 2),
            family(GC, 4),
            family(GC, 4),
        ];
        let selection = QueueSelection::assign(&families).unwrap();
        let main = selection.main();
        assert_eq!(main.family_index, 1);
        assert_eq!(main.queue_index, 0);
        assert!(main.is_main);
    }

    #[test]
    fn compute_prefers_most_specialized_family() {
        // Family 1 has one capability bit, family 2 has two; the tie-break
        // on bit count must pick family 1 even though both support compute.
        let families = [
            family(GC, 1),
            family(vk::QueueFlags::COMPUTE, 1),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, 1),
        ];
        let selection = QueueSelection::assign(&families).unwrap();
        let compute = selection.dedicated(QueueRole::Compute).unwrap();
        assert_eq!(compute.family_index, 1);
        assert!(!compute.is_main);
    }

    #[test]
    fn single_family_falls_back_to_main() {
        let families = [family(GC, 1)];
        let selection = QueueSelection::assign(&families).unwrap();

        assert!(selection.dedicated(QueueRole::Compute).is_none());
        assert!(selection.dedicated(QueueRole::Transfer).is_none());

        // Graphics+compute implies transfer support, so the lookup lands on
        // main rather than failing.
        let transfer = selection.queue_from_role(QueueRole::Transfer).unwrap();
        assert!(transfer.is_main);
        assert_eq!(transfer.family_index, 0);

        assert!(selection.queue_from_role(QueueRole::VideoEncode).is_none());
    }

    #[test]
    fn transfer_satisfied_without_explicit_bit() {
        // A compute-only family supports transfer implicitly.
        let families = [family(GC, 1), family(vk::QueueFlags::COMPUTE, 2)];
        let selection = QueueSelection::assign(&families).unwrap();

        let compute = selection.dedicated(QueueRole::Compute).unwrap();
        let transfer = selection.dedicated(QueueRole::Transfer).unwrap();
        assert_eq!(compute.family_index, 1);
        assert_eq!(transfer.family_index, 1);
        // Two roles on the same family consume distinct queues.
        assert_eq!(compute.queue_index, 0);
        assert_eq!(transfer.queue_index, 1);
    }

    #[test]
    fn exhausted_family_leaves_role_unset() {
        // The single non-main queue goes to COMPUTE; TRANSFER finds the
        // family exhausted and stays unset.
        let families = [family(GC, 1), family(vk::QueueFlags::COMPUTE, 1)];
        let selection = QueueSelection::assign(&families).unwrap();
        assert!(selection.dedicated(QueueRole::Compute).is_some());
        assert!(selection.dedicated(QueueRole::Transfer).is_none());

        // But the lookup still resolves through the dedicated compute queue.
        let transfer = selection.queue_from_role(QueueRole::Transfer).unwrap();
        assert_eq!(transfer.family_index, 1);
    }

    #[test]
    fn video_roles_assigned_when_present() {
        let families = [
            family(GC, 1),
            family(vk::QueueFlags::VIDEO_DECODE_KHR, 1),
            family(vk::QueueFlags::VIDEO_ENCODE_KHR, 1),
        ];
        let selection = QueueSelection::assign(&families).unwrap();
        assert_eq!(
            selection.dedicated(QueueRole::VideoDecode).unwrap().family_index,
            1
        );
        assert_eq!(
            selection.dedicated(QueueRole::VideoEncode).unwrap().family_index,
            2
        );
    }

    #[test]
    fn family_queue_counts_cover_all_assignments() {
        let families = [family(GC, 1), family(vk::QueueFlags::COMPUTE, 2)];
        let selection = QueueSelection::assign(&families).unwrap();
        let mut counts = selection.family_queue_counts();
        counts.sort_unstable();
        assert_eq!(counts, vec![(0, 1), (1, 2)]);
    }

    #[test]
    fn flags_label_lists_bits() {
        assert_eq!(flags_label(GC), "GRAPHICS|COMPUTE");
        assert_eq!(flags_label(vk::QueueFlags::empty()), "NONE");
    }
}
