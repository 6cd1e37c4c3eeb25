//! Group membership from FHIR, processed versions from `patient_versions`

use async_trait::async_trait;
use fhirlake_common::fingerprint::fingerprint_bytes;
use sqlx::{PgPool, Row};
use std::collections::{BTreeMap, HashMap};

use crate::error::Result;
use crate::fhir::FhirSearchOracle;
use crate::framework::patients::PatientSource;
use crate::jobs::PatientWrapper;

pub struct PgGroupPatientSource {
    fhir: FhirSearchOracle,
    pool: PgPool,
}

impl PgGroupPatientSource {
    pub fn new(fhir: FhirSearchOracle, pool: PgPool) -> Self {
        Self { fhir, pool }
    }
}

#[async_trait]
impl PatientSource for PgGroupPatientSource {
    async fn list_patients(&self, group_id: &str) -> Result<Vec<PatientWrapper>> {
        let mut hashes: Vec<String> = self
            .fhir
            .group_patient_ids(group_id)
            .await?
            .iter()
            .map(|id| fingerprint_bytes(id.as_bytes()))
            .collect();
        hashes.sort();
        hashes.dedup();

        let rows = sqlx::query(
            r#"
            SELECT patient_hash, version_id
            FROM patient_versions
            WHERE patient_hash = ANY($1)
            "#,
        )
        .bind(&hashes)
        .fetch_all(&self.pool)
        .await?;

        let mut versions = HashMap::with_capacity(rows.len());
        for row in rows {
            let hash: String = row.try_get("patient_hash")?;
            let version: i64 = row.try_get("version_id")?;
            versions.insert(hash, version);
        }

        Ok(hashes
            .into_iter()
            .map(|hash| PatientWrapper {
                version_id: versions.get(&hash).copied().unwrap_or(0),
                patient_hash: hash,
            })
            .collect())
    }

    async fn update_patient_versions(&self, versions: &BTreeMap<String, i64>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (hash, version) in versions {
            sqlx::query(
                r#"
                INSERT INTO patient_versions (patient_hash, version_id)
                VALUES ($1, $2)
                ON CONFLICT (patient_hash) DO UPDATE SET
                    version_id = GREATEST(patient_versions.version_id, excluded.version_id),
                    updated_at = NOW()
                "#,
            )
            .bind(hash)
            .bind(*version)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
