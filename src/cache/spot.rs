//! Spot instance request source

use std::sync::Arc;

use async_trait::async_trait;

use super::{CacheError, Source};
use crate::aws::{Ec2Api, SpotRequestDescription};
use crate::model::SpotRecord;

impl From<SpotRequestDescription> for SpotRecord {
    fn from(d: SpotRequestDescription) -> Self {
        SpotRecord {
            instance_id: d.instance_id,
            request_id: d.request_id,
            create_time: d.create_time,
            state: d.state,
            status_code: d.status_code,
            status_update_time: d.status_update_time,
        }
    }
}

pub struct SpotSource {
    api: Arc<dyn Ec2Api>,
}

impl SpotSource {
    pub fn new(api: Arc<dyn Ec2Api>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Source for SpotSource {
    type Record = SpotRecord;

    fn name(&self) -> &'static str {
        "spot"
    }

    // open requests have no instance yet and are dropped
    fn key(&self, record: &SpotRecord) -> String {
        record.instance_id.clone()
    }

    async fn fetch(&self) -> Result<Vec<SpotRecord>, CacheError> {
        let requests = self.api.describe_spot_requests().await?;
        Ok(requests.into_iter().map(SpotRecord::from).collect())
    }
}
