//! The pathology form filled in by voice.

use std::sync::Arc;

use chrono::NaiveDate;
use parking_lot::Mutex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct TissueSampleDescriptor {
    pub case_id: String,
    pub sample_type: String,
    pub patient_age: Option<u32>,
    pub collection_date: Option<NaiveDate>,
    pub measurements: Vec<String>,
    pub assessment: PathologicalAssessment,
    /// Additional notes.
    pub notes: String,
    pub staining_methods: Vec<String>,
    pub microscopic_findings: String,
    pub diagnosis: String,
    pub recommendations: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum PathologicalAssessment {
    #[default]
    Pending,
    Benign,
    PreCancerous,
    Cancerous,
}

/// Shared copy of the form, written by the model's tool calls and read by
/// the host.
#[derive(Debug, Clone, Default)]
pub struct FormStore(Arc<Mutex<TissueSampleDescriptor>>);

impl FormStore {
    pub fn replace(&self, form: TissueSampleDescriptor) {
        *self.0.lock() = form;
    }

    pub fn snapshot(&self) -> TissueSampleDescriptor {
        self.0.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_output_with_missing_fields_parses() {
        let raw = r#"{"caseId":"X1","assessment":"PreCancerous","collectionDate":"2024-03-05","measurements":["2x3 cm"]}"#;
        let form: TissueSampleDescriptor = serde_json::from_str(raw).expect("parse form");
        assert_eq!(form.case_id, "X1");
        assert_eq!(form.assessment, PathologicalAssessment::PreCancerous);
        assert_eq!(form.collection_date, NaiveDate::from_ymd_opt(2024, 3, 5));
        assert_eq!(form.measurements, vec!["2x3 cm".to_string()]);
        assert_eq!(form.notes, "");
    }

    #[test]
    fn schema_lists_every_field() {
        let schema = voxform_core::tools::schema_value::<TissueSampleDescriptor>().expect("schema");
        let props = schema["properties"].as_object().expect("properties");
        for field in [
            "caseId",
            "sampleType",
            "patientAge",
            "collectionDate",
            "measurements",
            "assessment",
            "notes",
            "stainingMethods",
            "microscopicFindings",
            "diagnosis",
            "recommendations",
        ] {
            assert!(props.contains_key(field), "missing {field}");
        }
    }

    #[test]
    fn store_replaces_whole_record() {
        let store = FormStore::default();
        store.replace(TissueSampleDescriptor {
            case_id: "A".into(),
            notes: "n".into(),
            ..Default::default()
        });
        store.replace(TissueSampleDescriptor {
            case_id: "B".into(),
            ..Default::default()
        });
        let form = store.snapshot();
        assert_eq!(form.case_id, "B");
        assert_eq!(form.notes, "");
    }
}
