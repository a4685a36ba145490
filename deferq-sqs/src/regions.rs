use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::error::SqsError;
use crate::transport::QueueService;

/// Friendly region names and the native identifiers they stand for.
pub const REGION_NAMES: [(&str, &str); 11] = [
    ("USGovWest", "us-gov-west-1"),
    ("USEast", "us-east-1"),
    ("USWest", "us-west-1"),
    ("USWest2", "us-west-2"),
    ("EUWest", "eu-west-1"),
    ("EUCentral", "eu-central-1"),
    ("APSoutheast", "ap-southeast-1"),
    ("APSoutheast2", "ap-southeast-2"),
    ("APNortheast", "ap-northeast-1"),
    ("SAEast", "sa-east-1"),
    ("CNNorth1", "cn-north-1"),
];

/// Native identifier for a friendly region name.
pub fn region_id(name: &str) -> Option<&'static str> {
    REGION_NAMES
        .iter()
        .find(|(friendly, _)| *friendly == name)
        .map(|(_, id)| *id)
}

/// Queue service handles keyed by friendly region name.
///
/// Built once at startup; credentials belong to whatever constructs the
/// services.
#[derive(Clone, Default)]
pub struct SqsRegions {
    services: HashMap<String, Arc<dyn QueueService>>,
}

impl fmt::Debug for SqsRegions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.services.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("SqsRegions").field("regions", &names).finish()
    }
}

impl SqsRegions {
    pub fn new() -> Self {
        Self::default()
    }

    /// One service per entry of [`REGION_NAMES`], built by `factory` from the
    /// native region id.
    pub fn init_all<F>(factory: F) -> Self
    where
        F: Fn(&'static str) -> Arc<dyn QueueService>,
    {
        let mut regions = Self::new();
        for (name, id) in REGION_NAMES {
            regions.insert(name, factory(id));
        }
        debug!(count = regions.services.len(), "initialized queue regions");
        regions
    }

    pub fn insert(&mut self, name: impl Into<String>, service: Arc<dyn QueueService>) -> &mut Self {
        self.services.insert(name.into(), service);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    pub fn service(&self, name: &str) -> Result<Arc<dyn QueueService>, SqsError> {
        self.services
            .get(name)
            .cloned()
            .ok_or_else(|| SqsError::UnknownRegion(name.to_owned()))
    }
}
