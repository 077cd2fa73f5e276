//! gRPC facade: thin, stateless pass-throughs from the wire service to the
//! [`Controller`].

use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::info;

use super::Controller;
use crate::pb;

pub struct InstancesService {
    controller: Arc<Controller>,
}

impl InstancesService {
    pub fn new(controller: Arc<Controller>) -> Self {
        Self { controller }
    }
}

#[tonic::async_trait]
impl pb::instances_server::Instances for InstancesService {
    async fn apply(
        &self,
        request: Request<pb::Instance>,
    ) -> Result<Response<pb::Instance>, Status> {
        let instance = request.into_inner();
        info!(instance = %instance.name, "apply requested");
        let applied = self.controller.apply(instance).await?;
        Ok(Response::new(applied))
    }

    async fn get(
        &self,
        request: Request<pb::GetOptions>,
    ) -> Result<Response<pb::InstanceList>, Status> {
        let list = self.controller.get(request.into_inner()).await?;
        Ok(Response::new(list))
    }

    async fn delete(
        &self,
        request: Request<pb::Instance>,
    ) -> Result<Response<pb::Instance>, Status> {
        let instance = request.into_inner();
        info!(instance = %instance.name, "delete requested");
        let deleted = self.controller.delete(instance).await?;
        Ok(Response::new(deleted))
    }

    async fn get_templates(
        &self,
        request: Request<pb::GetOptions>,
    ) -> Result<Response<pb::InstanceList>, Status> {
        let list = self.controller.get_templates(request.into_inner()).await?;
        Ok(Response::new(list))
    }
}
