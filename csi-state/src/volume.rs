//! CSI volume records and their claim bookkeeping.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StateError};
use crate::types::{
    AccessMode, Allocation, AttachmentMode, ClaimMode, ClaimState, VolumeClaim, VolumeKey,
};

/// A registered CSI volume.
///
/// The alloc maps hold allocation IDs; the store fills in the allocation on
/// read, and `None` means the allocation has been garbage collected.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CsiVolume {
    pub id: String,
    pub namespace: String,
    #[serde(default)]
    pub name: String,
    /// ID of the volume on the storage provider, if different from `id`
    #[serde(default)]
    pub external_id: String,
    pub plugin_id: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub access_mode: AccessMode,
    #[serde(default)]
    pub attachment_mode: AttachmentMode,
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,
    #[serde(default)]
    pub controller_required: bool,
    #[serde(default = "default_schedulable")]
    pub schedulable: bool,

    #[serde(default)]
    pub read_allocs: BTreeMap<String, Option<Allocation>>,
    #[serde(default)]
    pub write_allocs: BTreeMap<String, Option<Allocation>>,
    #[serde(default)]
    pub read_claims: BTreeMap<String, VolumeClaim>,
    #[serde(default)]
    pub write_claims: BTreeMap<String, VolumeClaim>,
    /// Claims of terminal allocations that are being released
    #[serde(default)]
    pub past_claims: BTreeMap<String, VolumeClaim>,

    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}

fn default_schedulable() -> bool {
    true
}

impl CsiVolume {
    pub fn key(&self) -> VolumeKey {
        VolumeKey::new(self.namespace.clone(), self.id.clone())
    }

    /// ID to send to the storage provider.
    pub fn remote_id(&self) -> &str {
        if self.external_id.is_empty() {
            &self.id
        } else {
            &self.external_id
        }
    }

    /// True while any allocation holds a read or write claim.
    pub fn in_use(&self) -> bool {
        !self.read_allocs.is_empty() || !self.write_allocs.is_empty()
    }

    /// True while there is anything for the unpublish workflow to look at.
    pub fn has_claims(&self) -> bool {
        self.in_use() || !self.past_claims.is_empty()
    }

    pub fn read_schedulable(&self) -> bool {
        self.schedulable
    }

    pub fn write_schedulable(&self) -> bool {
        self.schedulable
            && matches!(
                self.access_mode,
                AccessMode::SingleNodeWriter
                    | AccessMode::MultiNodeSingleWriter
                    | AccessMode::MultiNodeMultiWriter
            )
    }

    /// True if another write claim can be granted.
    pub fn write_free_claims(&self) -> bool {
        match self.access_mode {
            AccessMode::SingleNodeWriter | AccessMode::MultiNodeSingleWriter => {
                self.write_allocs.is_empty()
            }
            AccessMode::MultiNodeMultiWriter => true,
            _ => false,
        }
    }

    /// Apply a claim. Taken claims acquire the volume; anything else is a
    /// release or a checkpoint of the unpublish workflow.
    pub fn claim(&mut self, claim: &VolumeClaim, alloc: Option<&Allocation>) -> Result<()> {
        if claim.state == ClaimState::Taken {
            match claim.mode {
                ClaimMode::Read => return self.claim_read(claim, alloc),
                ClaimMode::Write => return self.claim_write(claim, alloc),
                ClaimMode::Gc | ClaimMode::Release => {}
            }
        }
        self.claim_release(claim);
        Ok(())
    }

    pub fn claim_read(&mut self, claim: &VolumeClaim, alloc: Option<&Allocation>) -> Result<()> {
        let id = &claim.allocation_id;
        if self.read_allocs.contains_key(id) {
            return Ok(());
        }
        if alloc.is_none() {
            return Err(StateError::UnknownAllocation(id.clone()));
        }
        if !self.read_schedulable() {
            return Err(StateError::Unschedulable(self.id.clone()));
        }

        self.read_allocs.insert(id.clone(), None);
        self.write_allocs.remove(id);
        self.read_claims.insert(id.clone(), claim.clone());
        self.write_claims.remove(id);
        self.past_claims.remove(id);
        Ok(())
    }

    pub fn claim_write(&mut self, claim: &VolumeClaim, alloc: Option<&Allocation>) -> Result<()> {
        let id = &claim.allocation_id;
        if self.write_allocs.contains_key(id) {
            return Ok(());
        }
        let Some(alloc) = alloc else {
            return Err(StateError::UnknownAllocation(id.clone()));
        };
        if !self.write_schedulable() {
            return Err(StateError::Unschedulable(self.id.clone()));
        }
        if !self.write_free_claims() {
            // Allocations of the same job may share the writer slot
            let foreign_holder = self.write_allocs.values().flatten().any(|holder| {
                holder.namespace != alloc.namespace || holder.job_id != alloc.job_id
            });
            if foreign_holder {
                return Err(StateError::MaxClaimsReached(self.id.clone()));
            }
        }

        self.write_allocs.insert(id.clone(), None);
        self.read_allocs.remove(id);
        self.write_claims.insert(id.clone(), claim.clone());
        self.read_claims.remove(id);
        self.past_claims.remove(id);
        Ok(())
    }

    /// Record release progress. Ready-to-free drops the allocation entirely;
    /// earlier states are kept as past claims so the workflow can resume.
    pub fn claim_release(&mut self, claim: &VolumeClaim) {
        let id = &claim.allocation_id;
        if claim.state == ClaimState::ReadyToFree {
            self.read_allocs.remove(id);
            self.write_allocs.remove(id);
            self.read_claims.remove(id);
            self.write_claims.remove(id);
            self.past_claims.remove(id);
        } else {
            self.past_claims.insert(id.clone(), claim.clone());
        }
    }

    /// Strip denormalized allocations before the record is stored.
    pub(crate) fn normalize(&mut self) {
        for alloc in self.read_allocs.values_mut() {
            *alloc = None;
        }
        for alloc in self.write_allocs.values_mut() {
            *alloc = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClientStatus, DesiredStatus};

    fn alloc(id: &str, job: &str) -> Allocation {
        Allocation {
            id: id.to_string(),
            namespace: "default".to_string(),
            job_id: job.to_string(),
            node_id: "node-1".to_string(),
            client_status: ClientStatus::Running,
            desired_status: DesiredStatus::Run,
            modify_index: 0,
        }
    }

    fn claim(alloc_id: &str, mode: ClaimMode, state: ClaimState) -> VolumeClaim {
        VolumeClaim {
            allocation_id: alloc_id.to_string(),
            node_id: "node-1".to_string(),
            mode,
            state,
        }
    }

    fn volume() -> CsiVolume {
        CsiVolume {
            id: "vol-1".to_string(),
            namespace: "default".to_string(),
            plugin_id: "plugin-1".to_string(),
            schedulable: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_remote_id_prefers_external_id() {
        let mut vol = volume();
        assert_eq!(vol.remote_id(), "vol-1");
        vol.external_id = "ebs-1234".to_string();
        assert_eq!(vol.remote_id(), "ebs-1234");
    }

    #[test]
    fn test_claim_read_then_release() {
        let mut vol = volume();
        let a = alloc("a1", "job");
        vol.claim(&claim("a1", ClaimMode::Read, ClaimState::Taken), Some(&a))
            .unwrap();
        assert!(vol.in_use());
        assert!(vol.read_claims.contains_key("a1"));

        vol.claim(
            &claim("a1", ClaimMode::Release, ClaimState::NodeDetached),
            None,
        )
        .unwrap();
        assert!(vol.in_use(), "checkpoint keeps the read claim");
        assert_eq!(vol.past_claims["a1"].state, ClaimState::NodeDetached);

        vol.claim(
            &claim("a1", ClaimMode::Release, ClaimState::ReadyToFree),
            None,
        )
        .unwrap();
        assert!(!vol.has_claims());
        assert!(vol.read_claims.is_empty());
    }

    #[test]
    fn test_claim_read_is_idempotent() {
        let mut vol = volume();
        let a = alloc("a1", "job");
        let c = claim("a1", ClaimMode::Read, ClaimState::Taken);
        vol.claim(&c, Some(&a)).unwrap();
        // a repeat doesn't need the allocation any more
        vol.claim(&c, None).unwrap();
        assert_eq!(vol.read_allocs.len(), 1);
    }

    #[test]
    fn test_claim_requires_allocation() {
        let mut vol = volume();
        let err = vol
            .claim(&claim("a1", ClaimMode::Read, ClaimState::Taken), None)
            .unwrap_err();
        assert_eq!(err, StateError::UnknownAllocation("a1".to_string()));
    }

    #[test]
    fn test_claim_unschedulable() {
        let mut vol = volume();
        vol.schedulable = false;
        let a = alloc("a1", "job");
        let err = vol
            .claim(&claim("a1", ClaimMode::Read, ClaimState::Taken), Some(&a))
            .unwrap_err();
        assert!(matches!(err, StateError::Unschedulable(_)));
    }

    #[test]
    fn test_single_writer_rejects_other_job() {
        let mut vol = volume();
        vol.access_mode = AccessMode::SingleNodeWriter;
        let mut a1 = alloc("a1", "job-a");
        vol.claim(&claim("a1", ClaimMode::Write, ClaimState::Taken), Some(&a1))
            .unwrap();
        // the store keeps the holder denormalized on read
        a1.client_status = ClientStatus::Running;
        vol.write_allocs.insert("a1".to_string(), Some(a1));

        let other = alloc("a2", "job-b");
        let err = vol
            .claim(
                &claim("a2", ClaimMode::Write, ClaimState::Taken),
                Some(&other),
            )
            .unwrap_err();
        assert!(matches!(err, StateError::MaxClaimsReached(_)));

        let sibling = alloc("a3", "job-a");
        vol.claim(
            &claim("a3", ClaimMode::Write, ClaimState::Taken),
            Some(&sibling),
        )
        .unwrap();
        assert_eq!(vol.write_allocs.len(), 2);
    }

    #[test]
    fn test_reader_only_volume_refuses_writers() {
        let mut vol = volume();
        vol.access_mode = AccessMode::MultiNodeReaderOnly;
        let a = alloc("a1", "job");
        assert!(!vol.write_schedulable());
        assert!(
            vol.claim(&claim("a1", ClaimMode::Write, ClaimState::Taken), Some(&a))
                .is_err()
        );
    }

    #[test]
    fn test_claim_moves_between_read_and_write() {
        let mut vol = volume();
        vol.access_mode = AccessMode::MultiNodeMultiWriter;
        let a = alloc("a1", "job");
        vol.claim(&claim("a1", ClaimMode::Read, ClaimState::Taken), Some(&a))
            .unwrap();
        vol.claim(&claim("a1", ClaimMode::Write, ClaimState::Taken), Some(&a))
            .unwrap();
        assert!(vol.read_allocs.is_empty());
        assert!(vol.read_claims.is_empty());
        assert!(vol.write_claims.contains_key("a1"));
    }

    #[test]
    fn test_gc_claim_records_past_claim() {
        let mut vol = volume();
        vol.claim(&claim("a1", ClaimMode::Gc, ClaimState::Taken), None)
            .unwrap();
        assert!(vol.has_claims());
        assert!(!vol.in_use());
    }

    #[test]
    fn test_normalize_strips_allocations() {
        let mut vol = volume();
        vol.read_allocs
            .insert("a1".to_string(), Some(alloc("a1", "job")));
        vol.normalize();
        assert_eq!(vol.read_allocs.get("a1"), Some(&None));
    }
}
