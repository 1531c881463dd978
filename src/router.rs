//! Proxy-role request director
//!
//! Places each (model, version) key on its R owning replicas via the
//! consistent-hash ring and hands the request to one of them, picked
//! uniformly at random. No retry across replicas: a failure surfaces to the
//! client, whose retry may land on a different owner only because of the
//! random pick.

use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tonic::transport::Channel;

use crate::cache::ModelId;
use crate::cluster::{ClusterConnection, Member};
use crate::error::Error;
use crate::proxy::{ChannelPool, GrpcDirector, RestDirector};

/// Routes requests to the replica owning the model key.
pub struct ShardRouter {
    cluster: Arc<ClusterConnection>,
    pool: Arc<ChannelPool>,
}

impl ShardRouter {
    /// Create a router over the cluster view and channel pool.
    pub fn new(cluster: Arc<ClusterConnection>, pool: Arc<ChannelPool>) -> Self {
        Self { cluster, pool }
    }

    /// One of the R owners of the key, picked uniformly at random.
    fn pick_owner(&self, key: &str) -> Result<Member, Error> {
        let mut owners = self.cluster.find_nodes_for_key(key)?;
        if owners.is_empty() {
            return Err(Error::NoMembers);
        }
        let index = rand::thread_rng().gen_range(0..owners.len());
        Ok(owners.swap_remove(index))
    }
}

#[async_trait]
impl RestDirector for ShardRouter {
    async fn direct(&self, model_name: &str, version: &str) -> Result<String, Error> {
        let id = ModelId::parse(model_name, version)?;
        let owner = self.pick_owner(&id.routing_key())?;
        Ok(format!("http://{}", owner.rest_authority()))
    }
}

#[async_trait]
impl GrpcDirector for ShardRouter {
    async fn channel_for(&self, model_name: &str, version: i64) -> Result<Channel, Error> {
        let id = ModelId::new(model_name, version);
        let owner = self.pick_owner(&id.routing_key())?;
        self.pool.channel(&owner.grpc_authority()).await
    }
}
