//! Build metadata exposed by the version endpoint and logged at startup.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

const UNKNOWN: &str = "?";

/// Produces the string and map forms of the running build.
pub trait VersionBuilder: Send + Sync + 'static {
    /// One-line form, logged when the service starts.
    fn to_display(&self) -> String;

    /// Map form, served as JSON by the version handler.
    fn to_map(&self) -> BTreeMap<String, String>;
}

/// Version, build date and commit of the running binary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BuildVersion {
    #[serde(rename = "version")]
    pub version_number: String,
    #[serde(rename = "buildDate")]
    pub build_date: String,
    #[serde(rename = "gitHash")]
    pub git_hash: String,
}

impl BuildVersion {
    /// Reads `GO_PIPELINE_LABEL` (or `VERSION`), `BUILD_DATE` and `GIT_HASH`.
    /// Missing values are reported as `?`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());
        Self {
            version_number: get("GO_PIPELINE_LABEL")
                .or_else(|| get("VERSION"))
                .unwrap_or_else(|| UNKNOWN.to_owned()),
            build_date: get("BUILD_DATE").unwrap_or_else(|| UNKNOWN.to_owned()),
            git_hash: get("GIT_HASH").unwrap_or_else(|| UNKNOWN.to_owned()),
        }
    }
}

impl fmt::Display for BuildVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "version: {} - buildDate: {} - git hash: {}",
            self.version_number, self.build_date, self.git_hash
        )
    }
}

impl VersionBuilder for BuildVersion {
    fn to_display(&self) -> String {
        self.to_string()
    }

    fn to_map(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("version".to_owned(), self.version_number.clone()),
            ("buildDate".to_owned(), self.build_date.clone()),
            ("gitHash".to_owned(), self.git_hash.clone()),
        ])
    }
}
