//! EC2 instance source

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use tracing::warn;

use super::{CacheError, Source};
use crate::aws::{Ec2Api, InstanceDescription};
use crate::model::Ec2Record;

const TERMINATION_REASON_PATTERN: &str =
    r"^User initiated \((\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}) ([A-Z]{1,5})\)$";

/// Parse a state-transition reason such as
/// `User initiated (2024-03-01 12:30:00 GMT)`. The zone abbreviation is read
/// as UTC, which is the only zone EC2 reports.
pub fn parse_termination_reason(reason: &str) -> Result<DateTime<Utc>, String> {
    let pattern = Regex::new(TERMINATION_REASON_PATTERN).map_err(|e| e.to_string())?;
    let captures = pattern
        .captures(reason.trim())
        .ok_or_else(|| format!("unexpected transition reason {:?}", reason))?;
    let naive = NaiveDateTime::parse_from_str(&captures[1], "%Y-%m-%d %H:%M:%S")
        .map_err(|e| format!("bad timestamp in {:?}: {}", reason, e))?;
    Ok(Utc.from_utc_datetime(&naive))
}

/// Convert one description; `None` for records that cannot be keyed
pub fn to_record(description: InstanceDescription) -> Option<Ec2Record> {
    if description.instance_id.is_empty() {
        warn!(
            private_dns_name = %description.private_dns_name,
            state = %description.state,
            "skipping instance without an id"
        );
        return None;
    }

    let termination_time = if description.state_transition_reason.is_empty() {
        None
    } else {
        match parse_termination_reason(&description.state_transition_reason) {
            Ok(at) => Some(at),
            Err(e) => {
                warn!(instance_id = %description.instance_id, error = %e, "cannot parse termination time");
                None
            }
        }
    };

    let instance_lifecycle = if description.instance_lifecycle.is_empty() {
        "on-demand".to_string()
    } else {
        description.instance_lifecycle
    };

    Some(Ec2Record {
        instance_id: description.instance_id,
        node_name: description.private_dns_name,
        state: description.state,
        instance_name: description.name,
        instance_type: description.instance_type,
        availability_zone: description.availability_zone,
        instance_lifecycle,
        launch_time: description.launch_time,
        termination_time,
    })
}

pub struct Ec2Source {
    api: Arc<dyn Ec2Api>,
}

impl Ec2Source {
    pub fn new(api: Arc<dyn Ec2Api>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Source for Ec2Source {
    type Record = Ec2Record;

    fn name(&self) -> &'static str {
        "ec2"
    }

    fn key(&self, record: &Ec2Record) -> String {
        record.instance_id.clone()
    }

    async fn fetch(&self) -> Result<Vec<Ec2Record>, CacheError> {
        let descriptions = self.api.describe_instances().await?;
        Ok(descriptions.into_iter().filter_map(to_record).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::memory::MemoryEc2;
    use crate::cache::{Snapshot, SourceCache};
    use crate::metrics::Metrics;

    fn description(id: &str) -> InstanceDescription {
        InstanceDescription {
            instance_id: id.to_string(),
            private_dns_name: format!("ip-{}.ec2.internal", id),
            state: "running".to_string(),
            name: "worker".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_termination_reason() {
        let at = parse_termination_reason("User initiated (2024-03-01 12:30:05 GMT)").unwrap();
        assert_eq!(at, Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap());

        assert!(parse_termination_reason("Server.SpotInstanceTermination").is_err());
        assert!(parse_termination_reason("User initiated (2024-13-01 12:30:05 GMT)").is_err());
        assert!(parse_termination_reason("User initiated").is_err());
    }

    #[test]
    fn test_to_record() {
        let mut d = description("i-1");
        d.state_transition_reason = "User initiated (2024-03-01 12:30:05 GMT)".to_string();
        let record = to_record(d).unwrap();
        assert_eq!(record.node_name, "ip-i-1.ec2.internal");
        assert_eq!(record.instance_name, "worker");
        assert_eq!(record.instance_lifecycle, "on-demand");
        assert!(record.termination_time.is_some());

        let mut spot = description("i-2");
        spot.instance_lifecycle = "spot".to_string();
        spot.state_transition_reason = "garbage".to_string();
        let record = to_record(spot).unwrap();
        assert_eq!(record.instance_lifecycle, "spot");
        assert_eq!(record.termination_time, None);

        assert!(to_record(description("")).is_none());
    }

    #[tokio::test]
    async fn test_ec2_cache_skips_empty_ids() {
        let api = Arc::new(MemoryEc2::new());
        api.set_instances(vec![description("i-2"), description(""), description("i-1")]);
        let cache = SourceCache::new(Ec2Source::new(api), Metrics::shared());

        cache.refresh().await.unwrap();
        let ids: Vec<_> = cache.list().into_iter().map(|r| r.instance_id).collect();
        assert_eq!(ids, vec!["i-1", "i-2"]);
    }
}
