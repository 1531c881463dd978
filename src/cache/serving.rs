//! Serving backend controller
//!
//! Client for the backend's model management surface: pushing a new
//! loaded-model config and reading per-model load state. The worker uses it
//! to keep the backend's active set in sync with the cache contents.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, error};

use mantle_proto::serving::v1::model_service_client::ModelServiceClient;
use mantle_proto::serving::v1::{
    model_server_config, servable_version_policy, GetModelStatusRequest, ModelConfig,
    ModelConfigList, ModelServerConfig, ModelSpec, ReloadConfigRequest, ServableVersionPolicy,
};

use super::{ModelArtifact, ModelId};
use crate::error::Error;

/// Backend load state of one model version.
pub use mantle_proto::serving::v1::model_version_status::State as ModelVersionState;

/// Model management surface of the serving backend.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ServingBackend: Send + Sync {
    /// Replace the backend's loaded-model config with the given artifacts.
    /// No retry; the caller decides what a failure means.
    async fn reload_config(&self, models: &[ModelArtifact], base_path: &str) -> Result<(), Error>;

    /// Load state of one model version.
    async fn model_status(&self, id: &ModelId) -> Result<ModelVersionState, Error>;

    /// Load states of every model the backend tracks.
    async fn model_states(&self) -> Result<Vec<ModelVersionState>, Error>;
}

/// gRPC client implementation of [`ServingBackend`].
pub struct ServingController {
    client: ModelServiceClient<Channel>,
    /// Status errors for this model are logged quietly (health probe noise)
    health_probe_model: String,
}

impl ServingController {
    /// Create a controller for the backend at `grpc_host` (`host:port`).
    ///
    /// The connection is established lazily so the proxy can start before the
    /// backend does.
    pub fn connect(
        grpc_host: &str,
        config_timeout: Duration,
        max_msg_size: usize,
        health_probe_model: String,
    ) -> Result<Self, Error> {
        let endpoint = Endpoint::from_shared(format!("http://{}", grpc_host))
            .map_err(|e| Error::Config(format!("invalid serving gRPC host: {}", e)))?
            .connect_timeout(config_timeout)
            .timeout(config_timeout);
        let channel = endpoint.connect_lazy();
        let client = ModelServiceClient::new(channel)
            .max_decoding_message_size(max_msg_size)
            .max_encoding_message_size(max_msg_size);
        Ok(Self {
            client,
            health_probe_model,
        })
    }
}

#[async_trait]
impl ServingBackend for ServingController {
    async fn reload_config(&self, models: &[ModelArtifact], base_path: &str) -> Result<(), Error> {
        let request = ReloadConfigRequest {
            config: Some(ModelServerConfig {
                config: Some(model_server_config::Config::ModelConfigList(
                    ModelConfigList {
                        config: build_model_configs(models, base_path),
                    },
                )),
            }),
        };

        debug!("Updating serving config");
        let mut client = self.client.clone();
        let response = client
            .handle_reload_config_request(request)
            .await
            .map_err(|e| Error::Reload(e.to_string()))?
            .into_inner();
        if let Some(status) = response.status {
            if status.error_code != 0 {
                return Err(Error::Reload(status.error_message));
            }
        }
        debug!("Serving config updated");
        Ok(())
    }

    async fn model_status(&self, id: &ModelId) -> Result<ModelVersionState, Error> {
        let request = GetModelStatusRequest {
            model_spec: Some(ModelSpec {
                name: id.name.clone(),
                version: Some(id.version),
                signature_name: String::new(),
            }),
        };
        let mut client = self.client.clone();
        let response = match client.get_model_status(request).await {
            Ok(response) => response.into_inner(),
            Err(e) => {
                if id.name != self.health_probe_model {
                    error!(model = %id, error = %e, "Error getting model status");
                } else {
                    debug!(model = %id, error = %e, "Error getting health probe model status");
                }
                return Err(Error::Backend(e.to_string()));
            }
        };
        match response.model_version_status.first() {
            Some(status) => Ok(status.state()),
            None => Err(Error::Backend(format!("model not found: {}", id))),
        }
    }

    async fn model_states(&self) -> Result<Vec<ModelVersionState>, Error> {
        let mut client = self.client.clone();
        let response = client
            .get_model_status(GetModelStatusRequest { model_spec: None })
            .await
            .map_err(|e| Error::Backend(e.to_string()))?
            .into_inner();
        Ok(response
            .model_version_status
            .iter()
            .map(|s| s.state())
            .collect())
    }
}

/// Build the backend config: one entry per model name with the explicit list
/// of cached versions, rooted under `base_path/{name}`.
fn build_model_configs(models: &[ModelArtifact], base_path: &str) -> Vec<ModelConfig> {
    let mut configs: Vec<ModelConfig> = Vec::with_capacity(models.len());
    let mut index: HashMap<String, usize> = HashMap::new();

    for artifact in models {
        let id = &artifact.id;
        if let Some(&i) = index.get(&id.name) {
            if let Some(servable_version_policy::PolicyChoice::Specific(specific)) = configs[i]
                .model_version_policy
                .as_mut()
                .and_then(|p| p.policy_choice.as_mut())
            {
                specific.versions.push(id.version);
            }
        } else {
            index.insert(id.name.clone(), configs.len());
            configs.push(ModelConfig {
                name: id.name.clone(),
                base_path: format!("{}/{}", base_path.trim_end_matches('/'), id.name),
                model_platform: "tensorflow".to_string(),
                model_version_policy: Some(ServableVersionPolicy {
                    policy_choice: Some(servable_version_policy::PolicyChoice::Specific(
                        servable_version_policy::Specific {
                            versions: vec![id.version],
                        },
                    )),
                }),
            });
        }
    }
    configs
}
