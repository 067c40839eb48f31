use std::collections::HashMap;
use std::time::Duration;

use rdkafka::error::KafkaError;
use rdkafka::producer::FutureProducer;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info};
use uuid::Uuid;

use common_kafka::config::KafkaConfig;
use common_kafka::kafka_producer::{create_kafka_producer, send_keyed, KafkaProduceError};
use common_kafka::transaction::TransactionalProducer;

use crate::metrics_consts::{
    RULES_PUBLISHED, RULE_BATCHES_FAILED, RULE_BATCHES_PUBLISHED, RULE_PUBLISH_FAILURES,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleMetric {
    Temperature,
    Humidity,
    PowerDraw,
    EnergyUse,
    SoilMoisture,
    BatteryLevel,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdType {
    Above,
    Below,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleSeverity {
    Info,
    Warning,
    Critical,
}

/// Wire shape of one alert rule on the rules topic, keyed by rule id.
/// Deletion is a tombstone: same key, null payload, which downstream
/// consumers of the compacted topic read as "forget this rule".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertRuleEvent {
    pub rule_id: Uuid,
    pub device_ids: Vec<String>,
    pub metric_type: RuleMetric,
    pub threshold_type: ThresholdType,
    pub threshold_value: f64,
    pub severity: RuleSeverity,
    pub is_enabled: bool,
}

/// One transactional publish: rule id to message, `None` meaning tombstone.
/// Either every entry becomes visible to consumers or none do.
pub type RuleBatch = HashMap<Uuid, Option<AlertRuleEvent>>;

#[derive(Debug, Error)]
pub enum RulePublishError {
    #[error("alert rule {rule_id} was not published")]
    RuleNotSent {
        rule_id: Uuid,
        #[source]
        source: KafkaProduceError,
    },
    #[error("alert rule batch of {} rules was not published", rule_ids.len())]
    BatchNotSent {
        rule_ids: Vec<Uuid>,
        #[source]
        source: KafkaProduceError,
    },
}

/// Publishes alert-rule lifecycle events, singly or as an all-or-nothing
/// transactional batch.
///
/// Single sends go through a plain producer and block on the delivery
/// report. Batches go through a transactional producer held in a `Mutex` so
/// only one batch is ever in flight; the producer type itself threads
/// ownership through begin/commit/abort, so overlapping transactions are
/// impossible even without the lock. A producer lost to a failed abort or
/// commit is recreated lazily on the next batch.
pub struct RulePublisher {
    producer: FutureProducer,
    transactional: Mutex<Option<TransactionalProducer>>,
    kafka: KafkaConfig,
    topic: String,
    transactional_id: String,
    send_timeout: Duration,
}

impl RulePublisher {
    pub async fn new(
        kafka: &KafkaConfig,
        topic: String,
        transactional_id: String,
        send_timeout: Duration,
    ) -> Result<Self, KafkaError> {
        let producer = create_kafka_producer(kafka).await?;
        Ok(Self {
            producer,
            transactional: Mutex::new(None),
            kafka: kafka.clone(),
            topic,
            transactional_id,
            send_timeout,
        })
    }

    /// Publish one rule create/update and wait for the broker's ack.
    pub async fn publish(&self, rule: &AlertRuleEvent) -> Result<(), RulePublishError> {
        self.send_one(rule.rule_id, Some(rule)).await
    }

    /// Publish a deletion tombstone for `rule_id`.
    pub async fn publish_tombstone(&self, rule_id: Uuid) -> Result<(), RulePublishError> {
        self.send_one(rule_id, None).await
    }

    async fn send_one(
        &self,
        rule_id: Uuid,
        payload: Option<&AlertRuleEvent>,
    ) -> Result<(), RulePublishError> {
        let kind = if payload.is_some() { "update" } else { "tombstone" };
        match send_keyed(
            &self.producer,
            &self.topic,
            &rule_id.to_string(),
            payload,
            self.send_timeout,
        )
        .await
        {
            Ok(_) => {
                metrics::counter!(RULES_PUBLISHED, "kind" => kind).increment(1);
                Ok(())
            }
            Err(source) => {
                metrics::counter!(RULE_PUBLISH_FAILURES, "kind" => kind).increment(1);
                Err(RulePublishError::RuleNotSent { rule_id, source })
            }
        }
    }

    /// Publish a batch of rule events inside one Kafka transaction.
    ///
    /// On any failure the transaction is aborted (best effort: an abort
    /// failure is logged and never masks the original error) and the error
    /// carries the full set of rule ids in the batch, matching the
    /// all-or-nothing visibility the transaction gives consumers.
    pub async fn publish_batch(&self, batch: RuleBatch) -> Result<(), RulePublishError> {
        if batch.is_empty() {
            return Ok(());
        }
        let rule_ids: Vec<Uuid> = batch.keys().copied().collect();

        // Serializes batches; held across the whole transaction.
        let mut slot = self.transactional.lock().await;

        let producer = match slot.take() {
            Some(producer) => producer,
            None => {
                info!("creating transactional rule producer");
                TransactionalProducer::from_config(
                    &self.kafka,
                    &self.transactional_id,
                    self.send_timeout,
                )
                .map_err(|e| Self::batch_error(&rule_ids, e.into()))?
            }
        };

        let transaction = producer
            .begin()
            .map_err(|e| Self::batch_error(&rule_ids, e.into()))?;

        for (rule_id, message) in &batch {
            if let Err(source) = transaction
                .send_keyed(&self.topic, &rule_id.to_string(), message.as_ref())
                .await
            {
                match transaction.abort() {
                    Ok(producer) => *slot = Some(producer),
                    Err(abort_error) => {
                        error!("failed to abort rule transaction: {abort_error}");
                    }
                }
                return Err(Self::batch_error(&rule_ids, source));
            }
        }

        match transaction.commit() {
            Ok(producer) => {
                *slot = Some(producer);
                metrics::counter!(RULE_BATCHES_PUBLISHED).increment(1);
                Ok(())
            }
            Err(e) => Err(Self::batch_error(&rule_ids, e.into())),
        }
    }

    fn batch_error(rule_ids: &[Uuid], source: KafkaProduceError) -> RulePublishError {
        metrics::counter!(RULE_BATCHES_FAILED).increment(1);
        RulePublishError::BatchNotSent {
            rule_ids: rule_ids.to_vec(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(rule_id: Uuid) -> AlertRuleEvent {
        AlertRuleEvent {
            rule_id,
            device_ids: vec!["greenhouse-probe-1".to_string()],
            metric_type: RuleMetric::SoilMoisture,
            threshold_type: ThresholdType::Below,
            threshold_value: 20.0,
            severity: RuleSeverity::Warning,
            is_enabled: true,
        }
    }

    #[test]
    fn rule_event_wire_shape_is_stable() {
        let rule_id = Uuid::parse_str("5f0c7b3a-9d5e-4a38-b7d1-46f42873c901").unwrap();
        let json = serde_json::to_value(rule(rule_id)).unwrap();

        assert_eq!(json["rule_id"], "5f0c7b3a-9d5e-4a38-b7d1-46f42873c901");
        assert_eq!(json["metric_type"], "soil_moisture");
        assert_eq!(json["threshold_type"], "below");
        assert_eq!(json["severity"], "warning");
        assert_eq!(json["is_enabled"], true);
    }

    #[test]
    fn rule_event_round_trips() {
        let original = rule(Uuid::new_v4());
        let json = serde_json::to_string(&original).unwrap();
        let parsed: AlertRuleEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn batch_error_carries_the_full_key_set() {
        let ids = vec![Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        let error = RulePublisher::batch_error(&ids, KafkaProduceError::DeliveryUnconfirmed);

        match error {
            RulePublishError::BatchNotSent { rule_ids, .. } => {
                assert_eq!(rule_ids, ids);
            }
            other => panic!("expected batch failure, got {other:?}"),
        }
    }

    #[test]
    fn tombstones_are_represented_as_absent_payloads() {
        let rule_id = Uuid::new_v4();
        let mut batch = RuleBatch::new();
        batch.insert(rule_id, None);

        let message = batch.get(&rule_id).unwrap();
        assert!(message.is_none());
        // The same key still rides along so compaction can apply the delete.
        assert!(batch.contains_key(&rule_id));
    }
}
