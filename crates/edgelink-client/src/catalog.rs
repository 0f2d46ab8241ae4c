//! Service catalog
//!
//! Holds the last-known set of reachable services and their parsed intercept
//! rules, diffs incoming snapshots against the previous state, and resolves
//! destination addresses to services by intercept specificity.

use crate::client::{OverlayClient, OverlayError};
use crate::events::ServiceChange;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use edgelink_proto::{
    parse_service_config, ClientConfig, InterceptConfig, PostureQuery, Service, CLIENT_CONFIG_V1,
    INTERCEPT_CONFIG_V1, MATCH_EXACT,
};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use tracing::{debug, error, info, warn};

/// Name-keyed service and intercept state.
pub(crate) struct ServiceCatalog {
    services: DashMap<String, Service>,
    intercepts: DashMap<String, InterceptConfig>,
}

impl ServiceCatalog {
    pub fn new() -> Self {
        Self {
            services: DashMap::new(),
            intercepts: DashMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Service> {
        self.services.get(name).map(|entry| entry.value().clone())
    }

    pub fn all(&self) -> Vec<Service> {
        self.services
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn clear(&self) {
        self.services.clear();
        self.intercepts.clear();
    }
}

impl OverlayClient {
    /// Apply a full service snapshot: diff against the previous state, emit
    /// add/change/remove notifications, purge state owned by removed
    /// services, and recompute intercept rules and posture queries.
    pub(crate) fn apply_service_snapshot(&self, services: Vec<Service>) {
        debug!("processing service updates with {} services", services.len());
        let catalog = &self.inner.catalog;

        let current_ids: HashSet<&str> = services.iter().map(|svc| svc.id.as_str()).collect();

        let removed: Vec<Service> = catalog
            .services
            .iter()
            .filter(|entry| !current_ids.contains(entry.value().id.as_str()))
            .map(|entry| entry.value().clone())
            .collect();

        for service in removed {
            catalog.services.remove(&service.name);
            catalog.intercepts.remove(&service.name);
            self.inner.sessions.invalidate_service(&service.id);
            self.inner.events.service_removed.emit(&service);
            if let Some(hook) = &self.inner.options.on_service_update {
                hook(ServiceChange::Removed, &service);
            }
        }

        for service in &services {
            let (was_present, differs) = match catalog.services.entry(service.name.clone()) {
                Entry::Occupied(mut occupied) => {
                    let differs = occupied.get() != service;
                    occupied.insert(service.clone());
                    (true, differs)
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(service.clone());
                    (false, false)
                }
            };

            if !was_present {
                self.inner.events.service_added.emit(service);
                if let Some(hook) = &self.inner.options.on_service_update {
                    hook(ServiceChange::Added, service);
                }
            } else if differs {
                self.inner.events.service_changed.emit(service);
                if let Some(hook) = &self.inner.options.on_service_update {
                    hook(ServiceChange::Changed, service);
                }
            }

            self.recompute_intercept(service);
        }

        let mut query_map: HashMap<String, HashMap<String, PostureQuery>> = HashMap::new();
        for entry in catalog.services.iter() {
            let service = entry.value();
            for set in &service.posture_queries {
                for query in &set.posture_queries {
                    query_map
                        .entry(service.id.clone())
                        .or_default()
                        .insert(query.id.clone(), query.clone());
                }
            }
        }
        self.inner.posture.set_service_query_map(query_map);
    }

    /// Parse the service's intercept configuration, trying the host-based
    /// shape first and the legacy client config second. Absence of both means
    /// no intercept; a malformed blob is logged and treated the same.
    fn recompute_intercept(&self, service: &Service) {
        let catalog = &self.inner.catalog;

        match parse_service_config::<InterceptConfig>(service, INTERCEPT_CONFIG_V1) {
            Ok(Some(config)) => {
                catalog.intercepts.insert(service.name.clone(), config);
                return;
            }
            Ok(None) => {}
            Err(err) => {
                warn!(
                    service = %service.name,
                    "failed to parse config[{INTERCEPT_CONFIG_V1}]: {err}"
                );
                catalog.intercepts.remove(&service.name);
                return;
            }
        }

        match parse_service_config::<ClientConfig>(service, CLIENT_CONFIG_V1) {
            Ok(Some(config)) => {
                catalog
                    .intercepts
                    .insert(service.name.clone(), config.to_intercept());
            }
            Ok(None) => {
                catalog.intercepts.remove(&service.name);
            }
            Err(err) => {
                warn!(
                    service = %service.name,
                    "failed to parse config[{CLIENT_CONFIG_V1}]: {err}"
                );
                catalog.intercepts.remove(&service.name);
            }
        }
    }

    /// Find the service whose intercept matches the destination best.
    ///
    /// Lower score is more specific; ties break to the lexicographically
    /// smallest service name, and a perfect match short-circuits the scan.
    pub fn get_service_for_addr(
        &self,
        protocol: &str,
        host: &str,
        port: u16,
    ) -> Result<(Service, u32), OverlayError> {
        let mut best: Option<(String, u32)> = None;

        for entry in self.inner.catalog.intercepts.iter() {
            let name = entry.key();
            let Some(score) = entry.value().match_addr(protocol, host, port) else {
                continue;
            };

            let better = match &best {
                None => true,
                Some((best_name, best_score)) => {
                    score < *best_score || (score == *best_score && name < best_name)
                }
            };
            if better {
                best = Some((name.clone(), score));
            }
            if score == MATCH_EXACT {
                break;
            }
        }

        let (name, score) = best.ok_or_else(|| {
            OverlayError::NoServiceForAddress(format!("{protocol}:{host}:{port}"))
        })?;
        let service = self
            .inner
            .catalog
            .get(&name)
            .ok_or(OverlayError::ServiceNotFound(name))?;
        Ok((service, score))
    }

    /// Refresh the service list from the control plane. With `force` false,
    /// the fetch is skipped when the control plane reports no changes.
    ///
    /// Boxed: a full authentication triggered from here refreshes services
    /// again, and that cycle must not inline infinitely.
    pub(crate) fn sync_services(
        &self,
        force: bool,
    ) -> Pin<Box<dyn Future<Output = Result<(), OverlayError>> + Send + '_>> {
        Box::pin(async move {
            self.ensure_api_session().await?;

            debug!("checking if service updates available");
            let mut check = force;
            let mut last_update = None;

            match self.inner.control.is_service_list_update_available().await {
                Ok((changed, at)) => {
                    check = check || changed;
                    last_update = at;
                }
                Err(err) => {
                    error!("failed to check if service list update is available: {err}");
                    if err.is_unauthorized() {
                        if let Err(auth_err) = self.authenticate().await {
                            error!("unable to re-authenticate during service refresh: {auth_err}");
                        } else if let Ok((changed, at)) =
                            self.inner.control.is_service_list_update_available().await
                        {
                            check = check || changed;
                            last_update = at;
                        } else {
                            check = true;
                        }
                    } else {
                        check = true;
                    }
                }
            }

            if !check {
                return Ok(());
            }

            debug!("refreshing services");
            let services = match self.inner.control.get_services().await {
                Ok(services) => services,
                Err(err) if err.is_unauthorized() => {
                    info!("attempting to re-authenticate");
                    if let Err(auth_err) = self.authenticate().await {
                        error!("unable to re-authenticate during service refresh: {auth_err}");
                        return Err(err.into());
                    }
                    self.inner.control.get_services().await?
                }
                Err(err) => return Err(err.into()),
            };

            *self.inner.last_service_update.write().unwrap() = last_update;
            self.apply_service_snapshot(services);
            Ok(())
        })
    }
}
