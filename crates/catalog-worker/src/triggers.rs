//! Event-trigger dispatch (`spec.md` §4.5, §8): subscribes to the event
//! bus, matches every `event_triggers` row registered for the incoming
//! type, and starts a run per match. Delivery outcome feeds back into
//! the trigger's throttle/failure-pause bookkeeping.

use std::sync::Arc;

use catalog_core::{DeliveryStatus, TriggerDelivery, TriggerSnapshot, TriggeredBy};
use catalog_engine::{matches_predicate, record_delivery_outcome, should_fire, CreateRunRequest, RunOrchestrator};
use catalog_events::Bus;
use catalog_storage::StateStore;
use chrono::Utc;
use futures::StreamExt;
use uuid::Uuid;

pub async fn run(store: Arc<dyn StateStore>, orchestrator: Arc<RunOrchestrator>, bus: Arc<dyn Bus>) {
    let mut stream = bus.subscribe();
    while let Some(envelope) = stream.next().await {
        let triggers = match store.list_event_triggers_for_type(&envelope.event_type).await {
            Ok(triggers) => triggers,
            Err(err) => {
                tracing::warn!(error = %err.message, "failed to list event triggers");
                continue;
            }
        };

        for mut trigger in triggers {
            let now = Utc::now();
            if !should_fire(&trigger, &envelope.event_type, Some(envelope.source.as_str()), now) {
                continue;
            }
            if !matches_predicate(trigger.predicate.as_ref(), &envelope.payload) {
                continue;
            }

            let outcome = dispatch_trigger(&store, &orchestrator, &trigger, envelope.id).await;
            let succeeded = outcome.is_ok();
            let paused_now = record_delivery_outcome(&mut trigger, succeeded);
            if paused_now {
                tracing::warn!(trigger_id = %trigger.id, "event trigger paused after repeated delivery failures");
            }
            trigger.last_fired_at = Some(now);

            let delivery = TriggerDelivery {
                id: Uuid::now_v7(),
                event_trigger_id: trigger.id,
                event_id: envelope.id,
                status: if succeeded { DeliveryStatus::Launched } else { DeliveryStatus::Failed },
                workflow_run_id: outcome.as_ref().ok().copied(),
                error_message: outcome.as_ref().err().map(|err| err.message.clone()),
                created_at: now,
            };
            if let Err(err) = store.record_trigger_delivery(delivery).await {
                tracing::warn!(error = %err.message, "failed to record trigger delivery");
            }
            if let Err(err) = store.update_event_trigger(trigger).await {
                tracing::warn!(error = %err.message, "failed to persist event trigger state");
            }
        }
    }
}

async fn dispatch_trigger(
    store: &Arc<dyn StateStore>,
    orchestrator: &Arc<RunOrchestrator>,
    trigger: &catalog_core::EventTrigger,
    source_event_id: Uuid,
) -> Result<Uuid, catalog_core::EngineError> {
    let definition = store.get_definition(trigger.workflow_definition_id).await?;
    let snapshot = TriggerSnapshot {
        triggered_by: TriggeredBy::Event,
        schedule_id: None,
        event_trigger_id: Some(trigger.id),
        source_event_id: Some(source_event_id),
        asset_id: None,
    };
    let run = orchestrator
        .create_run(CreateRunRequest {
            workflow_definition_id: trigger.workflow_definition_id,
            parameters: definition.default_parameters,
            run_key: None,
            triggered_by: TriggeredBy::Event,
            trigger: Some(snapshot),
            partition_key: None,
        })
        .await?;
    Ok(run.id)
}
