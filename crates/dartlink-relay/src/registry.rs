//! Dynamic registry of invocable procedures discovered from connected debug
//! targets, merged with an immutable operator-configured static set.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::server::{ClientType, RelayServer, ServerMethod};
use crate::vm::IsolateTracker;

/// What a registered procedure is surfaced as on the MCP side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcedureKind {
    #[default]
    Tool,
    Resource,
}

/// One entry in the registry.
///
/// `owner_connection_id` is a back-reference used for invalidation when the
/// owning connection closes; static entries have no owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredProcedure {
    pub id: String,
    #[serde(default)]
    pub kind: ProcedureKind,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub invocation_target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_connection_id: Option<String>,
}

/// Which source wins when a static and a dynamic entry share an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CollisionPolicy {
    /// Operator-configured entries shadow dynamic registrations.
    #[default]
    PreferStatic,
    PreferDynamic,
}

/// Configuration for the registry.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// File the dynamic set is persisted to; `None` disables persistence.
    pub storage_path: Option<PathBuf>,
    /// Save after every mutation.
    pub auto_save: bool,
    pub collision_policy: CollisionPolicy,
    /// Deadline applied to proxied invocations.
    pub call_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            storage_path: None,
            auto_save: true,
            collision_policy: CollisionPolicy::default(),
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Receipt returned by a batch registration.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationReceipt {
    pub tools: Vec<String>,
    pub resources: Vec<String>,
    pub registered_at: String,
    pub total_entries: usize,
}

/// Runtime-mutable table of invocable procedures.
///
/// Upserts are atomic per id; both the registration path and the invocation
/// path may touch the table concurrently.
pub struct ToolRegistry {
    dynamic: RwLock<HashMap<String, RegisteredProcedure>>,
    static_set: Vec<RegisteredProcedure>,
    config: RegistryConfig,
    relay: RelayServer,
    /// Direct VM Service route for entries not pinned to a relay connection.
    vm: RwLock<Option<Arc<IsolateTracker>>>,
}

impl ToolRegistry {
    /// Build a registry over `relay`, loading any persisted dynamic set.
    pub fn new(
        relay: RelayServer,
        static_set: Vec<RegisteredProcedure>,
        config: RegistryConfig,
    ) -> Result<Self> {
        let registry = Self {
            dynamic: RwLock::new(HashMap::new()),
            static_set,
            config,
            relay,
            vm: RwLock::new(None),
        };
        registry.load()?;
        Ok(registry)
    }

    /// Route ownerless procedures through a direct VM Service connection
    /// instead of a relay-tracked app connection.
    pub fn set_vm_target(&self, tracker: Arc<IsolateTracker>) {
        let mut vm = self.vm.write().unwrap_or_else(|e| e.into_inner());
        *vm = Some(tracker);
    }

    fn load(&self) -> Result<()> {
        let Some(path) = self.config.storage_path.as_ref() else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }
        let data = fs::read_to_string(path)?;
        let entries: HashMap<String, RegisteredProcedure> = serde_json::from_str(&data)?;
        info!("loaded {} persisted registrations", entries.len());
        let mut dynamic = self.dynamic.write().unwrap_or_else(|e| e.into_inner());
        *dynamic = entries;
        Ok(())
    }

    fn save(&self) -> Result<()> {
        let Some(path) = self.config.storage_path.as_ref() else {
            return Ok(());
        };
        let snapshot = {
            let dynamic = self.dynamic.read().unwrap_or_else(|e| e.into_inner());
            dynamic.clone()
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(&snapshot)?;
        fs::write(path, data)?;
        Ok(())
    }

    fn save_if_auto(&self) {
        if !self.config.auto_save {
            return;
        }
        if let Err(err) = self.save() {
            warn!("failed to persist registry: {}", err);
        }
    }

    /// Upsert one procedure. Registering an existing id overwrites the prior
    /// entry, never duplicates it.
    pub fn register(&self, procedure: RegisteredProcedure) {
        {
            let mut dynamic = self.dynamic.write().unwrap_or_else(|e| e.into_inner());
            dynamic.insert(procedure.id.clone(), procedure);
        }
        self.save_if_auto();
    }

    /// Upsert a batch on behalf of `owner`, de-duplicating by id (last write
    /// wins), and return the registration receipt.
    pub fn register_batch(
        &self,
        owner: &str,
        procedures: Vec<RegisteredProcedure>,
    ) -> RegistrationReceipt {
        let mut tools = Vec::new();
        let mut resources = Vec::new();
        {
            let mut dynamic = self.dynamic.write().unwrap_or_else(|e| e.into_inner());
            for mut procedure in procedures {
                procedure.owner_connection_id = Some(owner.to_string());
                match procedure.kind {
                    ProcedureKind::Tool => {
                        if !tools.contains(&procedure.id) {
                            tools.push(procedure.id.clone());
                        }
                        resources.retain(|id| id != &procedure.id);
                    }
                    ProcedureKind::Resource => {
                        if !resources.contains(&procedure.id) {
                            resources.push(procedure.id.clone());
                        }
                        tools.retain(|id| id != &procedure.id);
                    }
                }
                dynamic.insert(procedure.id.clone(), procedure);
            }
        }
        self.save_if_auto();

        let total_entries = {
            let dynamic = self.dynamic.read().unwrap_or_else(|e| e.into_inner());
            dynamic.len()
        };
        RegistrationReceipt {
            tools,
            resources,
            registered_at: chrono::Utc::now().to_rfc3339(),
            total_entries,
        }
    }

    /// Resolve an id through the merged static+dynamic view.
    pub fn lookup(&self, id: &str) -> Option<RegisteredProcedure> {
        let dynamic_hit = {
            let dynamic = self.dynamic.read().unwrap_or_else(|e| e.into_inner());
            dynamic.get(id).cloned()
        };
        let static_hit = self.static_set.iter().find(|p| p.id == id).cloned();
        match self.config.collision_policy {
            CollisionPolicy::PreferStatic => static_hit.or(dynamic_hit),
            CollisionPolicy::PreferDynamic => dynamic_hit.or(static_hit),
        }
    }

    /// The merged procedure list, optionally restricted to one owner.
    ///
    /// With an owner filter only that connection's dynamic registrations are
    /// returned; the unfiltered view applies the collision policy.
    pub fn list_all(&self, owner: Option<&str>) -> Vec<RegisteredProcedure> {
        let dynamic: Vec<RegisteredProcedure> = {
            let guard = self.dynamic.read().unwrap_or_else(|e| e.into_inner());
            guard.values().cloned().collect()
        };

        if let Some(owner) = owner {
            let mut entries: Vec<RegisteredProcedure> = dynamic
                .into_iter()
                .filter(|p| p.owner_connection_id.as_deref() == Some(owner))
                .collect();
            entries.sort_by(|a, b| a.id.cmp(&b.id));
            return entries;
        }

        let mut merged: HashMap<String, RegisteredProcedure> = HashMap::new();
        match self.config.collision_policy {
            CollisionPolicy::PreferStatic => {
                for procedure in dynamic {
                    merged.insert(procedure.id.clone(), procedure);
                }
                for procedure in &self.static_set {
                    merged.insert(procedure.id.clone(), procedure.clone());
                }
            }
            CollisionPolicy::PreferDynamic => {
                for procedure in &self.static_set {
                    merged.insert(procedure.id.clone(), procedure.clone());
                }
                for procedure in dynamic {
                    merged.insert(procedure.id.clone(), procedure);
                }
            }
        }
        let mut entries: Vec<RegisteredProcedure> = merged.into_values().collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    /// Drop every registration owned by `owner`. Returns how many were
    /// removed. Called when the owning connection is detected closed, so
    /// stale tools never appear invocable after their owner vanishes.
    pub fn invalidate_owner(&self, owner: &str) -> usize {
        let removed = {
            let mut dynamic = self.dynamic.write().unwrap_or_else(|e| e.into_inner());
            let before = dynamic.len();
            dynamic.retain(|_, p| p.owner_connection_id.as_deref() != Some(owner));
            before - dynamic.len()
        };
        if removed > 0 {
            debug!("invalidated {} registrations owned by {}", removed, owner);
            self.save_if_auto();
        }
        removed
    }

    /// Remove every dynamic registration.
    pub fn clear_dynamic(&self) {
        {
            let mut dynamic = self.dynamic.write().unwrap_or_else(|e| e.into_inner());
            dynamic.clear();
        }
        self.save_if_auto();
    }

    /// Invoke a procedure by id, proxying through the relay.
    ///
    /// Arguments are checked against the input schema before dispatch and the
    /// result against the output schema before it is returned; a mismatch on
    /// either side fails instead of forwarding malformed data.
    pub async fn invoke(&self, id: &str, arguments: Value) -> Result<Value> {
        let procedure = self
            .lookup(id)
            .ok_or_else(|| Error::MethodNotFound(id.to_string()))?;

        if let Some(schema) = procedure.input_schema.as_ref() {
            validate_against(schema, &arguments, "arguments")?;
        }

        let result = match procedure.owner_connection_id.as_ref() {
            Some(owner) => {
                self.relay
                    .call_client_method_with_timeout(
                        owner,
                        &procedure.invocation_target,
                        Some(arguments),
                        self.config.call_timeout,
                    )
                    .await?
            }
            None => {
                // Ownerless (static) entries: prefer the direct VM route,
                // fall back to the first open Flutter-side connection.
                let tracker = {
                    let vm = self.vm.read().unwrap_or_else(|e| e.into_inner());
                    vm.clone()
                };
                match tracker {
                    Some(tracker) => {
                        tracker
                            .call_extension(
                                &procedure.invocation_target,
                                arguments,
                                Some(self.config.call_timeout),
                            )
                            .await?
                    }
                    None => {
                        let target = self
                            .relay
                            .connections_of(ClientType::Flutter)
                            .await
                            .into_iter()
                            .next()
                            .ok_or(Error::NotConnected)?;
                        self.relay
                            .call_client_method_with_timeout(
                                &target,
                                &procedure.invocation_target,
                                Some(arguments),
                                self.config.call_timeout,
                            )
                            .await?
                    }
                }
            }
        };

        if let Some(schema) = procedure.output_schema.as_ref() {
            validate_against(schema, &result, "result")?;
        }
        Ok(result)
    }
}

fn validate_against(schema: &Value, instance: &Value, what: &str) -> Result<()> {
    let validator = jsonschema::validator_for(schema)
        .map_err(|err| Error::Validation(format!("invalid {} schema: {}", what, err)))?;
    if !validator.is_valid(instance) {
        return Err(Error::Validation(format!(
            "{} do not match the declared schema",
            what
        )));
    }
    Ok(())
}

/// Relay-side handler for the dynamic registration call.
///
/// Accepts either a bare array of procedure descriptors or an object with a
/// `procedures` array, registers them against the calling connection, and
/// returns the registration receipt.
pub struct RegisterDynamicsMethod {
    registry: Arc<ToolRegistry>,
}

impl RegisterDynamicsMethod {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ServerMethod for RegisterDynamicsMethod {
    async fn handle(&self, connection_id: &str, params: Value) -> Result<Value> {
        let descriptors = match params {
            Value::Array(items) => Value::Array(items),
            Value::Object(mut map) => map
                .remove("procedures")
                .ok_or_else(|| Error::Validation("missing 'procedures' array".to_string()))?,
            _ => {
                return Err(Error::Validation(
                    "expected an array of procedure descriptors".to_string(),
                ));
            }
        };
        let procedures: Vec<RegisteredProcedure> = serde_json::from_value(descriptors)?;
        let receipt = self.registry.register_batch(connection_id, procedures);
        Ok(serde_json::to_value(receipt)?)
    }
}
