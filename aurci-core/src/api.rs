//! Wire types exchanged between the controller and its workers.
//!
//! Field names are PascalCase on the wire; discriminants are the stable
//! integers from [`crate::model`].

use serde::{Deserialize, Serialize};

/// One unit of work handed to a worker: a claimed build together with its
/// dependency list and a base64-encoded tar of the package sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Work {
    pub build_id: i64,
    pub package_base: String,
    pub dependencies: Vec<String>,
    pub package_base_data_base64: String,
}

/// Result report sent by a worker after executing a [`Work`] unit.
///
/// `status` is a raw [`crate::model::WorkResultStatus`] discriminant;
/// the dispatcher validates it on receipt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WorkResultReport {
    pub build_id: i64,
    pub status: i64,
    #[serde(default)]
    pub pacman_exit_code: i64,
    #[serde(default)]
    pub pacman_log_base64: String,
    #[serde(default)]
    pub makepkg_extract_exit_code: i64,
    #[serde(default)]
    pub makepkg_extract_log_base64: String,
    #[serde(default)]
    pub makepkg_build_exit_code: i64,
    #[serde(default)]
    pub makepkg_build_log_base64: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_serializes_with_wire_field_names() {
        let work = Work {
            build_id: 42,
            package_base: "bar".into(),
            dependencies: vec!["glibc".into()],
            package_base_data_base64: "AAAA".into(),
        };
        let json = serde_json::to_value(&work).unwrap();
        assert_eq!(json["BuildId"], 42);
        assert_eq!(json["PackageBase"], "bar");
        assert_eq!(json["Dependencies"][0], "glibc");
        assert_eq!(json["PackageBaseDataBase64"], "AAAA");
    }

    #[test]
    fn report_accepts_minimal_payload() {
        let report: WorkResultReport =
            serde_json::from_str(r#"{"BuildId": 42, "Status": 0}"#).unwrap();
        assert_eq!(report.build_id, 42);
        assert_eq!(report.status, 0);
        assert_eq!(report.pacman_exit_code, 0);
        assert_eq!(report.pacman_log_base64, "");
    }
}
