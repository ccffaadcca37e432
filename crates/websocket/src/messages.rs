use serde::{Deserialize, Serialize};

use events::EventEnvelope;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { filter: Option<SubscriptionFilter> },
    Unsubscribe,
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Event { envelope: EventEnvelope },
    Subscribed { filter: Option<SubscriptionFilter> },
    Unsubscribed,
    Pong,
    Error { message: String },
}

/// Narrows a subscription. Every criterion that is set must match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    /// Experiment names
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiments: Option<Vec<String>>,
    /// Resource kinds, e.g. `pipeline` or `terminal`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<String>>,
    /// Resource names, e.g. the `experiment/run/loop` key of one pipeline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Vec<String>>,
}

impl SubscriptionFilter {
    pub fn for_experiment(experiment: impl Into<String>) -> Self {
        Self {
            experiments: Some(vec![experiment.into()]),
            ..Default::default()
        }
    }

    pub fn for_pipeline(experiment: &str, run: usize, loop_index: usize) -> Self {
        Self {
            kinds: Some(vec!["pipeline".to_string()]),
            resources: Some(vec![events::pipeline_key(experiment, run, loop_index)]),
            ..Default::default()
        }
    }

    pub fn matches(&self, envelope: &EventEnvelope) -> bool {
        let experiment_ok = match (&self.experiments, envelope.event.experiment()) {
            (Some(names), Some(experiment)) => names.iter().any(|n| n == experiment),
            // events outside any experiment, such as errors, always pass
            _ => true,
        };
        let kind_ok = self
            .kinds
            .as_ref()
            .map_or(true, |kinds| kinds.contains(&envelope.resource.kind));
        let resource_ok = self
            .resources
            .as_ref()
            .map_or(true, |names| names.contains(&envelope.resource.name));

        experiment_ok && kind_ok && resource_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use events::Event;

    fn run_started(experiment: &str) -> EventEnvelope {
        EventEnvelope::new(Event::RunStarted {
            experiment: experiment.to_string(),
            run: 0,
        })
    }

    fn pipeline_updated(experiment: &str, loop_index: usize) -> EventEnvelope {
        EventEnvelope::new(Event::PipelineUpdated {
            experiment: experiment.to_string(),
            run: 0,
            loop_index,
            pipeline: serde_json::json!({}),
        })
    }

    #[test]
    fn test_client_message_deserialize() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ping));

        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"subscribe","filter":{"experiments":["exp"]}}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::Subscribe { filter } => {
                assert_eq!(filter, Some(SubscriptionFilter::for_experiment("exp")))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_server_message_serialize() {
        let json = serde_json::to_string(&ServerMessage::Pong).unwrap();
        assert_eq!(json, r#"{"type":"pong"}"#);
    }

    #[test]
    fn test_empty_filter_matches_all() {
        let filter = SubscriptionFilter::default();
        assert!(filter.matches(&run_started("exp")));
        assert!(filter.matches(&pipeline_updated("other", 1)));
    }

    #[test]
    fn test_experiment_filter() {
        let filter = SubscriptionFilter::for_experiment("exp");
        assert!(filter.matches(&run_started("exp")));
        assert!(!filter.matches(&run_started("other")));

        let error = EventEnvelope::new(Event::Error {
            message: "test".to_string(),
            context: None,
        });
        assert!(filter.matches(&error));
    }

    #[test]
    fn test_pipeline_filter_is_scoped_to_one_loop() {
        let filter = SubscriptionFilter::for_pipeline("exp", 0, 1);
        assert!(filter.matches(&pipeline_updated("exp", 1)));
        assert!(!filter.matches(&pipeline_updated("exp", 0)));
        assert!(!filter.matches(&run_started("exp")));
    }
}
