//! Patient source for group-scoped runs

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::jobs::PatientWrapper;

#[async_trait]
pub trait PatientSource: Send + Sync {
    /// Members of `group_id` with their last processed versions, in a stable
    /// order. The orchestrator resumes by index into this list.
    async fn list_patients(&self, group_id: &str) -> Result<Vec<PatientWrapper>>;

    /// Persist the versions reported by a completed job
    async fn update_patient_versions(&self, versions: &BTreeMap<String, i64>) -> Result<()>;
}

/// Fixed patient list
pub struct StaticPatientSource {
    patients: Vec<PatientWrapper>,
    versions: Mutex<BTreeMap<String, i64>>,
}

impl StaticPatientSource {
    pub fn new(patients: Vec<PatientWrapper>) -> Self {
        Self {
            patients,
            versions: Mutex::new(BTreeMap::new()),
        }
    }

    pub async fn versions(&self) -> BTreeMap<String, i64> {
        self.versions.lock().await.clone()
    }
}

#[async_trait]
impl PatientSource for StaticPatientSource {
    async fn list_patients(&self, _group_id: &str) -> Result<Vec<PatientWrapper>> {
        let versions = self.versions.lock().await;
        Ok(self
            .patients
            .iter()
            .map(|p| PatientWrapper {
                patient_hash: p.patient_hash.clone(),
                version_id: versions.get(&p.patient_hash).copied().unwrap_or(p.version_id),
            })
            .collect())
    }

    async fn update_patient_versions(&self, versions: &BTreeMap<String, i64>) -> Result<()> {
        let mut stored = self.versions.lock().await;
        for (hash, version) in versions {
            stored.insert(hash.clone(), *version);
        }
        Ok(())
    }
}
