//! Lifecycle Manager - Main application use case
//!
//! Orchestrates the client registry and the cloud provider: decides whether
//! a client already has an instance, creates one exactly once per address,
//! serves readiness polling, switches applications and reclaims expired
//! instances. This is the primary interface for the inbound adapter.

use crate::application::client_registry::{Claim, ClientRegistry};
use crate::domain::entities::{CreateInstanceRequest, InstanceRecord, ProviderInstance, RecordPatch};
use crate::domain::errors::{LifecycleError, ProviderError};
use crate::domain::ports::{Clock, CloudProvider};
use crate::domain::value_objects::{ApplicationCatalog, ApplicationTemplate, SessionId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Tunables for instance lifetime and reclamation.
#[derive(Debug, Clone)]
pub struct LifecyclePolicy {
    /// Time-to-live granted on creation and on every refresh
    pub ttl: chrono::Duration,
    /// Sweep attempts before an undeletable instance is dropped from tracking
    pub max_delete_attempts: u32,
    /// How long clients should wait after READY before following the redirect
    pub ready_delay_hint: Duration,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            ttl: chrono::Duration::hours(1),
            max_delete_attempts: 3,
            ready_delay_hint: Duration::from_secs(15),
        }
    }
}

/// Where a client stands after [`LifecycleManager::resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolveState {
    /// Instance requested but not reachable yet; keep polling
    Pending,
    /// Instance reachable at the record's address
    Ready,
    /// Client already holds an instance for another application
    Conflict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub state: ResolveState,
    pub session_id: SessionId,
    pub record: InstanceRecord,
}

/// Result of a readiness poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    NotFound,
    Pending { message: String },
    Ready {
        address: String,
        port: u16,
        delay_hint: Duration,
    },
    /// The provider could not be queried; the record is kept
    ProviderError { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchOutcome {
    pub session_id: SessionId,
    pub record: InstanceRecord,
}

/// Counters from one sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub reclaimed: usize,
    /// Expired in the snapshot but refreshed before deletion
    pub refreshed: usize,
    /// Provider delete failed; kept for the next sweep
    pub failed: usize,
    /// Dropped from tracking after repeated delete failures
    pub abandoned: usize,
}

/// Provider instance joined with the session tracking it, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedInstance {
    pub instance: ProviderInstance,
    pub session: Option<(SessionId, InstanceRecord)>,
}

/// Result of an administrative delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminDeletion {
    /// Session purged from the registry, if one tracked the instance
    pub session_id: Option<SessionId>,
    /// Whether the provider confirmed the instance is gone
    pub provider_deleted: bool,
}

enum Provisioned {
    Created(SessionId, InstanceRecord),
    Existing(SessionId, InstanceRecord),
}

/// Instance lifecycle manager.
pub struct LifecycleManager {
    registry: Arc<ClientRegistry>,
    provider: Arc<dyn CloudProvider>,
    catalog: Arc<ApplicationCatalog>,
    clock: Arc<dyn Clock>,
    policy: LifecyclePolicy,
    sweep_guard: tokio::sync::Mutex<()>,
    delete_failures: DashMap<SessionId, u32>,
}

impl LifecycleManager {
    pub fn new(
        registry: Arc<ClientRegistry>,
        provider: Arc<dyn CloudProvider>,
        catalog: Arc<ApplicationCatalog>,
        clock: Arc<dyn Clock>,
        policy: LifecyclePolicy,
    ) -> Self {
        Self {
            registry,
            provider,
            catalog,
            clock,
            policy,
            sweep_guard: tokio::sync::Mutex::new(()),
            delete_failures: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn catalog(&self) -> &ApplicationCatalog {
        &self.catalog
    }

    pub fn policy(&self) -> &LifecyclePolicy {
        &self.policy
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn template(&self, application: &str) -> Result<&ApplicationTemplate, LifecycleError> {
        self.catalog
            .get(application)
            .ok_or_else(|| LifecycleError::InvalidApplication(application.to_string()))
    }

    /// Resolve the instance for a client.
    ///
    /// The address index wins over the session token when both point at
    /// live records: the address identifies the person, the token can be
    /// handed around. With no live record reachable a new instance is
    /// requested and the result is `Pending`.
    pub async fn resolve(
        &self,
        address: &str,
        session_id: Option<&SessionId>,
        application: &str,
    ) -> Result<Resolution, LifecycleError> {
        let template = self.template(application)?;
        let now = self.clock.now();

        if let Some((sid, record)) = self.find_live(address, session_id, now) {
            return Ok(self.on_existing(sid, record, application).await);
        }

        match self.provision(address, application, template).await? {
            Provisioned::Created(session_id, record) => Ok(Resolution {
                state: ResolveState::Pending,
                session_id,
                record,
            }),
            Provisioned::Existing(session_id, record) => {
                Ok(self.on_existing(session_id, record, application).await)
            }
        }
    }

    fn find_live(
        &self,
        address: &str,
        session_id: Option<&SessionId>,
        now: DateTime<Utc>,
    ) -> Option<(SessionId, InstanceRecord)> {
        let by_address = self
            .registry
            .get_by_address(address)
            .filter(|(_, record)| !record.is_expired(now));
        if by_address.is_some() {
            return by_address;
        }

        let sid = session_id?;
        self.registry
            .get(sid)
            .filter(|record| !record.is_expired(now))
            .map(|record| (sid.clone(), record))
    }

    async fn on_existing(
        &self,
        session_id: SessionId,
        mut record: InstanceRecord,
        application: &str,
    ) -> Resolution {
        if record.application != application {
            tracing::debug!(
                "session {} holds {} but {} was requested",
                session_id,
                record.application,
                application
            );
            return Resolution {
                state: ResolveState::Conflict,
                session_id,
                record,
            };
        }

        let now = self.clock.now();
        let expires_at = now + self.policy.ttl;
        if self.registry.refresh_if_live(&session_id, now, expires_at) {
            record.expires_at = expires_at;
        }

        let state = if self.confirm_ready(&session_id, &mut record).await {
            ResolveState::Ready
        } else {
            ResolveState::Pending
        };
        Resolution {
            state,
            session_id,
            record,
        }
    }

    /// Check with the provider that a record with an address is still active.
    ///
    /// An instance that stopped being active loses its address, so it goes
    /// back through polling before the next redirect. A failed query is
    /// reported as not ready and leaves the record alone.
    async fn confirm_ready(&self, session_id: &SessionId, record: &mut InstanceRecord) -> bool {
        let Some(instance_id) = record.instance_id.filter(|_| record.is_ready()) else {
            return false;
        };

        match self.provider.get(instance_id).await {
            Ok(instance) if instance.status.is_active() => true,
            Ok(instance) => {
                tracing::info!(
                    "instance {} is {}, waiting before redirecting again",
                    instance_id,
                    instance.status
                );
                self.registry.update(session_id, RecordPatch::address(""));
                record.address.clear();
                false
            }
            Err(e) => {
                tracing::warn!("status check for instance {} failed: {}", instance_id, e);
                false
            }
        }
    }

    /// Claim the address and, if the claim is ours, create the instance.
    ///
    /// The placeholder reserves the address before the provider call so
    /// concurrent requests for the same address see it and do not create
    /// a second instance. A failed create releases the placeholder.
    async fn provision(
        &self,
        address: &str,
        application: &str,
        template: &ApplicationTemplate,
    ) -> Result<Provisioned, LifecycleError> {
        let now = self.clock.now();
        let placeholder =
            InstanceRecord::pending(application, template.port, address, now, self.policy.ttl);

        let (session_id, mut record) = match self.registry.claim(address, now, placeholder) {
            Claim::Existing { session_id, record } => {
                return Ok(Provisioned::Existing(session_id, record))
            }
            Claim::Claimed { session_id, record } => (session_id, record),
        };

        let request = CreateInstanceRequest {
            template_id: template.template_id,
            name: format!("{}-{}-{}", application, session_id, now.timestamp_millis()),
            region: template.region.clone(),
            size: template.size.clone(),
        };

        let instance = match self.provider.create(&request).await {
            Ok(instance) => instance,
            Err(e) => {
                self.registry.release_claim(&session_id);
                tracing::warn!("create {} for {} failed: {}", application, address, e);
                return Err(LifecycleError::ProvisionFailed {
                    application: application.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        if !self
            .registry
            .update(&session_id, RecordPatch::instance_id(instance.id))
        {
            // The reservation was torn down while the provider call was in flight.
            tracing::warn!(
                "session {} released during creation, deleting instance {}",
                session_id,
                instance.id
            );
            if let Err(e) = self.delete_instance(instance.id).await {
                tracing::warn!("failed to delete orphaned instance {}: {}", instance.id, e);
            }
            return Err(LifecycleError::ProvisionFailed {
                application: application.to_string(),
                reason: "reservation released before the instance was recorded".to_string(),
            });
        }

        record.instance_id = Some(instance.id);
        tracing::info!(
            "created instance {} ({}) for {} session={}",
            instance.id,
            application,
            address,
            session_id
        );
        Ok(Provisioned::Created(session_id, record))
    }

    /// Report whether the session's instance is reachable yet.
    ///
    /// Readiness is caller-driven: each poll makes at most one provider
    /// call and back-fills the public address once the instance is active.
    pub async fn poll_status(&self, session_id: &SessionId) -> PollStatus {
        let now = self.clock.now();
        let Some(record) = self
            .registry
            .get(session_id)
            .filter(|record| !record.is_expired(now))
        else {
            return PollStatus::NotFound;
        };

        let Some(instance_id) = record.instance_id else {
            return PollStatus::Pending {
                message: "Instance creation has been requested".to_string(),
            };
        };

        let instance = match self.provider.get(instance_id).await {
            Ok(instance) => instance,
            Err(e) => {
                tracing::warn!("status check for instance {} failed: {}", instance_id, e);
                return PollStatus::ProviderError {
                    message: e.to_string(),
                };
            }
        };

        if !instance.status.is_active() {
            return PollStatus::Pending {
                message: format!("Instance is still being prepared ({})", instance.status),
            };
        }

        let Some(ip) = instance.public_address() else {
            return PollStatus::Pending {
                message: "Instance is ready but waiting for IP address allocation".to_string(),
            };
        };

        if record.address != ip && !self.registry.update(session_id, RecordPatch::address(ip)) {
            return PollStatus::NotFound;
        }

        PollStatus::Ready {
            address: ip.to_string(),
            port: record.port,
            delay_hint: self.policy.ready_delay_hint,
        }
    }

    /// Extend a session's expiry to now + TTL.
    ///
    /// An expired record is treated as absent and is not revived.
    pub fn refresh_ttl(&self, session_id: &SessionId) -> bool {
        let now = self.clock.now();
        self.registry.refresh_if_live(session_id, now, now + self.policy.ttl)
    }

    /// Replace a client's instance with one for another application.
    ///
    /// The old session and whatever the address currently owns are torn
    /// down first; teardown never fails on provider errors. A fresh session
    /// is minted for the new instance.
    pub async fn switch_application(
        &self,
        old_session_id: &SessionId,
        application: &str,
        address: &str,
    ) -> Result<SwitchOutcome, LifecycleError> {
        let template = self.template(application)?;

        self.teardown(old_session_id).await;
        if let Some(current) = self.registry.address_of(address) {
            if current != *old_session_id {
                self.teardown(&current).await;
            }
        }

        match self.provision(address, application, template).await? {
            Provisioned::Created(session_id, record) => {
                tracing::info!(
                    "switched {} from session {} to {} ({})",
                    address,
                    old_session_id,
                    session_id,
                    application
                );
                Ok(SwitchOutcome { session_id, record })
            }
            // A concurrent request already claimed the address again.
            Provisioned::Existing(session_id, record) if record.application == application => {
                Ok(SwitchOutcome { session_id, record })
            }
            Provisioned::Existing(session_id, record) => Err(LifecycleError::Conflict {
                session_id,
                application: record.application,
            }),
        }
    }

    /// Provider delete, then registry delete. A missing session is a no-op.
    async fn teardown(&self, session_id: &SessionId) -> Option<InstanceRecord> {
        let record = self.registry.get(session_id)?;
        if let Some(instance_id) = record.instance_id {
            if let Err(e) = self.delete_instance(instance_id).await {
                tracing::warn!(
                    "delete of instance {} failed, dropping session {} anyway: {}",
                    instance_id,
                    session_id,
                    e
                );
            }
        }
        self.delete_failures.remove(session_id);
        self.registry.delete(session_id)
    }

    /// Delete at the provider; an instance that is already gone counts as deleted.
    async fn delete_instance(&self, instance_id: u64) -> Result<(), ProviderError> {
        match self.provider.delete(instance_id).await {
            Err(e) if !e.is_not_found() => Err(e),
            _ => Ok(()),
        }
    }

    /// Reclaim every instance past its expiry.
    ///
    /// Returns `None` when another sweep is already running. Each record is
    /// re-read right before its provider delete so a refresh that landed
    /// after the snapshot keeps it alive.
    pub async fn sweep_expired(&self) -> Option<SweepReport> {
        let Ok(_guard) = self.sweep_guard.try_lock() else {
            tracing::debug!("sweep already running, skipping");
            return None;
        };

        let mut report = SweepReport::default();
        let snapshot_time = self.clock.now();

        for (session_id, snapshot) in self.registry.all() {
            report.examined += 1;
            if !snapshot.is_expired(snapshot_time) {
                continue;
            }

            let now = self.clock.now();
            let Some(current) = self.registry.get(&session_id) else {
                continue;
            };
            if !current.is_expired(now) {
                report.refreshed += 1;
                continue;
            }

            let Some(instance_id) = current.instance_id else {
                // Placeholder left behind by an interrupted creation
                if self.registry.delete_if_expired(&session_id, now).is_some() {
                    report.reclaimed += 1;
                }
                continue;
            };

            if let Err(e) = self.delete_instance(instance_id).await {
                let attempts = {
                    let mut entry = self.delete_failures.entry(session_id.clone()).or_insert(0);
                    *entry += 1;
                    *entry
                };
                if attempts < self.policy.max_delete_attempts {
                    tracing::warn!(
                        "failed to delete expired instance {} (attempt {}): {}",
                        instance_id,
                        attempts,
                        e
                    );
                    report.failed += 1;
                    continue;
                }
                tracing::error!(
                    "giving up on expired instance {} after {} attempts: {}",
                    instance_id,
                    attempts,
                    e
                );
                report.abandoned += 1;
            } else {
                report.reclaimed += 1;
            }

            self.delete_failures.remove(&session_id);
            self.registry.delete(&session_id);
            tracing::info!(
                "reclaimed expired instance {} ({}) session={}",
                instance_id,
                current.application,
                session_id
            );
        }

        if report.reclaimed > 0 || report.failed > 0 || report.abandoned > 0 {
            tracing::info!(
                "sweep examined={} reclaimed={} failed={} abandoned={}",
                report.examined,
                report.reclaimed,
                report.failed,
                report.abandoned
            );
        }
        Some(report)
    }

    // ===== Administrative operations =====

    /// Every tracked session, oldest first.
    pub fn list_all(&self) -> Vec<(SessionId, InstanceRecord)> {
        let mut all = self.registry.all();
        all.sort_by(|a, b| a.1.created_at.cmp(&b.1.created_at));
        all
    }

    /// Provider-side listing joined with registry tracking.
    pub async fn list_instances(&self) -> Result<Vec<ManagedInstance>, LifecycleError> {
        let instances = self.provider.list().await?;
        Ok(instances
            .into_iter()
            .map(|instance| {
                let session = self.registry.get_by_instance_id(instance.id);
                ManagedInstance { instance, session }
            })
            .collect())
    }

    /// Delete an instance by provider id and purge any session tracking it.
    pub async fn delete_by_instance_id(&self, instance_id: u64) -> AdminDeletion {
        let provider_deleted = match self.delete_instance(instance_id).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("admin delete of instance {} failed: {}", instance_id, e);
                false
            }
        };

        let session_id = self
            .registry
            .get_by_instance_id(instance_id)
            .map(|(session_id, _)| session_id);
        if let Some(session_id) = &session_id {
            self.delete_failures.remove(session_id);
            self.registry.delete(session_id);
        }

        tracing::info!(
            "admin deleted instance {} (session {:?})",
            instance_id,
            session_id.as_ref().map(SessionId::as_str)
        );
        AdminDeletion {
            session_id,
            provider_deleted,
        }
    }

    pub async fn reboot_by_instance_id(&self, instance_id: u64) -> Result<(), LifecycleError> {
        self.provider.reboot(instance_id).await?;
        tracing::info!("admin rebooted instance {}", instance_id);
        Ok(())
    }

    /// Refresh the TTL of the live session tracking an instance. Returns the new expiry.
    pub fn refresh_by_instance_id(
        &self,
        instance_id: u64,
    ) -> Result<DateTime<Utc>, LifecycleError> {
        let (session_id, _) = self
            .registry
            .get_by_instance_id(instance_id)
            .ok_or(LifecycleError::InstanceNotFound(instance_id))?;

        let now = self.clock.now();
        let expires_at = now + self.policy.ttl;
        if self.registry.refresh_if_live(&session_id, now, expires_at) {
            Ok(expires_at)
        } else {
            Err(LifecycleError::InstanceNotFound(instance_id))
        }
    }
}
