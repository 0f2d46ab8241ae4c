//! Posture-check cache
//!
//! The minimal surface the core drives: which services are actively in use,
//! and which posture queries each service requires. An external posture
//! submission process consumes both views.

use dashmap::DashSet;
use edgelink_proto::PostureQuery;
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Default)]
pub struct PostureCache {
    active_services: DashSet<String>,
    service_queries: RwLock<HashMap<String, HashMap<String, PostureQuery>>>,
}

impl PostureCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Mark a service as actively dialed or hosted so its posture state is
    /// kept fresh.
    pub fn add_active_service(&self, service_id: &str) {
        self.active_services.insert(service_id.to_string());
    }

    pub fn is_service_active(&self, service_id: &str) -> bool {
        self.active_services.contains(service_id)
    }

    /// Replace the service → query-id → query mapping wholesale.
    pub(crate) fn set_service_query_map(
        &self,
        map: HashMap<String, HashMap<String, PostureQuery>>,
    ) {
        *self.service_queries.write().unwrap() = map;
    }

    pub fn queries_for_service(&self, service_id: &str) -> Option<HashMap<String, PostureQuery>> {
        self.service_queries
            .read()
            .unwrap()
            .get(service_id)
            .cloned()
    }
}
