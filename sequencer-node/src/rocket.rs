//! Rocket projection
//!
//! Folds the ordered event stream of each rocket channel into its current
//! state. Used as the node's downstream sink.

use async_trait::async_trait;
use dashmap::DashMap;
use sequencer_core::{OrderedSink, SequencedMessage};
use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering;
use thiserror::Error;
use tracing::{debug, info};

const EVENT_LAUNCHED: &str = "RocketLaunched";
const EVENT_SPEED_INCREASED: &str = "RocketSpeedIncreased";
const EVENT_SPEED_DECREASED: &str = "RocketSpeedDecreased";
const EVENT_MISSION_CHANGED: &str = "RocketMissionChanged";
const EVENT_EXPLODED: &str = "RocketExploded";

/// Rocket projection errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RocketError {
    /// Message type not recognised
    #[error("Unknown message type: {0}")]
    UnknownEventType(String),

    /// Required payload field absent or of the wrong type
    #[error("Missing '{field}' in {event_type} event")]
    MissingField {
        /// Field name
        field: &'static str,
        /// Event type being parsed
        event_type: &'static str,
    },

    /// Delivered number skips ahead of the last applied one
    #[error("Sequence gap on {channel}: last applied {last_applied}, received {received}")]
    SequenceGap {
        /// Rocket channel
        channel: String,
        /// Last applied number
        last_applied: u64,
        /// Delivered number
        received: u64,
    },

    /// Speed change does not fit the speed range
    #[error("Speed out of range on {channel}: {speed} {op} {by}")]
    SpeedOutOfRange {
        /// Rocket channel
        channel: String,
        /// Speed before the change
        speed: i64,
        /// `+` or `-`
        op: char,
        /// Delta
        by: i64,
    },

    /// Delivered number is older than the last applied one
    #[error("Sequence regression on {channel}: last applied {last_applied}, received {received}")]
    SequenceRegression {
        /// Rocket channel
        channel: String,
        /// Last applied number
        last_applied: u64,
        /// Delivered number
        received: u64,
    },
}

impl From<RocketError> for sequencer_core::Error {
    fn from(err: RocketError) -> Self {
        match err {
            // Ordering problems may clear up once the missing number arrives
            RocketError::SequenceGap { .. } | RocketError::SequenceRegression { .. } => {
                sequencer_core::Error::Delivery(err.to_string())
            }
            RocketError::UnknownEventType(_)
            | RocketError::MissingField { .. }
            | RocketError::SpeedOutOfRange { .. } => {
                sequencer_core::Error::Rejected(err.to_string())
            }
        }
    }
}

/// Rocket domain event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RocketEvent {
    /// Rocket (re)launched
    Launched {
        /// Rocket model
        rocket_type: String,
        /// Initial speed
        launch_speed: i64,
        /// Mission name
        mission: String,
    },
    /// Speed went up
    SpeedIncreased {
        /// Delta
        by: i64,
    },
    /// Speed went down
    SpeedDecreased {
        /// Delta
        by: i64,
    },
    /// Mission renamed
    MissionChanged {
        /// New mission name
        new_mission: String,
    },
    /// Rocket lost
    Exploded {
        /// Cause
        reason: String,
    },
}

impl RocketEvent {
    /// Parse an event from its type tag and payload
    pub fn parse(message_type: &str, payload: &Value) -> Result<Self, RocketError> {
        match message_type {
            EVENT_LAUNCHED => Ok(RocketEvent::Launched {
                rocket_type: require_str(payload, "type", EVENT_LAUNCHED)?,
                launch_speed: require_int(payload, "launchSpeed", EVENT_LAUNCHED)?,
                mission: require_str(payload, "mission", EVENT_LAUNCHED)?,
            }),
            EVENT_SPEED_INCREASED => Ok(RocketEvent::SpeedIncreased {
                by: require_int(payload, "by", EVENT_SPEED_INCREASED)?,
            }),
            EVENT_SPEED_DECREASED => Ok(RocketEvent::SpeedDecreased {
                by: require_int(payload, "by", EVENT_SPEED_DECREASED)?,
            }),
            EVENT_MISSION_CHANGED => Ok(RocketEvent::MissionChanged {
                new_mission: require_str(payload, "newMission", EVENT_MISSION_CHANGED)?,
            }),
            EVENT_EXPLODED => Ok(RocketEvent::Exploded {
                reason: require_str(payload, "reason", EVENT_EXPLODED)?,
            }),
            other => Err(RocketError::UnknownEventType(other.to_string())),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            RocketEvent::Launched { .. } => EVENT_LAUNCHED,
            RocketEvent::SpeedIncreased { .. } => EVENT_SPEED_INCREASED,
            RocketEvent::SpeedDecreased { .. } => EVENT_SPEED_DECREASED,
            RocketEvent::MissionChanged { .. } => EVENT_MISSION_CHANGED,
            RocketEvent::Exploded { .. } => EVENT_EXPLODED,
        }
    }
}

fn require_str(
    payload: &Value,
    field: &'static str,
    event_type: &'static str,
) -> Result<String, RocketError> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(RocketError::MissingField { field, event_type })
}

fn require_int(
    payload: &Value,
    field: &'static str,
    event_type: &'static str,
) -> Result<i64, RocketError> {
    payload
        .get(field)
        .and_then(Value::as_i64)
        .ok_or(RocketError::MissingField { field, event_type })
}

/// Rocket status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RocketStatus {
    /// Operational
    Launched,
    /// Lost; only a relaunch is applied
    Exploded,
}

/// Current state of one rocket
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RocketState {
    /// Rocket channel (the partition key)
    pub channel: String,
    /// Rocket model
    #[serde(rename = "type")]
    pub rocket_type: String,
    /// Current speed
    pub speed: i64,
    /// Current mission
    pub mission: String,
    /// Status
    pub status: RocketStatus,
    /// Cause of the last explosion
    pub explosion_reason: String,
    /// Last applied message number
    pub last_applied: u64,
}

impl RocketState {
    /// Fresh state for a channel
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            rocket_type: String::new(),
            speed: 0,
            mission: String::new(),
            status: RocketStatus::Launched,
            explosion_reason: String::new(),
            last_applied: 0,
        }
    }

    /// Fold an event; returns `Ok(false)` when the event was ignored
    ///
    /// A failed event leaves the state untouched.
    pub fn apply(&mut self, event: RocketEvent) -> Result<bool, RocketError> {
        if self.status == RocketStatus::Exploded && !matches!(event, RocketEvent::Launched { .. }) {
            return Ok(false);
        }

        match event {
            RocketEvent::Launched {
                rocket_type,
                launch_speed,
                mission,
            } => {
                self.rocket_type = rocket_type;
                self.speed = launch_speed;
                self.mission = mission;
                self.status = RocketStatus::Launched;
            }
            RocketEvent::SpeedIncreased { by } => self.speed = self.change_speed('+', by)?,
            RocketEvent::SpeedDecreased { by } => self.speed = self.change_speed('-', by)?,
            RocketEvent::MissionChanged { new_mission } => self.mission = new_mission,
            RocketEvent::Exploded { reason } => {
                self.status = RocketStatus::Exploded;
                self.explosion_reason = reason;
            }
        }
        Ok(true)
    }

    fn change_speed(&self, op: char, by: i64) -> Result<i64, RocketError> {
        let changed = match op {
            '+' => self.speed.checked_add(by),
            _ => self.speed.checked_sub(by),
        };
        changed.ok_or_else(|| RocketError::SpeedOutOfRange {
            channel: self.channel.clone(),
            speed: self.speed,
            op,
            by,
        })
    }
}

/// Sort column for [`RocketProjection::all`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortField {
    /// Channel (default)
    #[default]
    Channel,
    /// Speed
    Speed,
    /// Rocket type
    Type,
    /// Mission
    Mission,
    /// Status
    Status,
}

impl SortField {
    /// Parse a query parameter; unknown or absent values sort by channel
    pub fn from_param(value: Option<&str>) -> Self {
        match value.map(str::to_lowercase).as_deref() {
            Some("speed") => SortField::Speed,
            Some("type") => SortField::Type,
            Some("mission") => SortField::Mission,
            Some("status") => SortField::Status,
            _ => SortField::Channel,
        }
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// Ascending (default)
    #[default]
    Asc,
    /// Descending
    Desc,
}

impl SortOrder {
    /// Parse a query parameter; only `desc` selects descending
    pub fn from_param(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.eq_ignore_ascii_case("desc") => SortOrder::Desc,
            _ => SortOrder::Asc,
        }
    }
}

/// In-memory rocket states fed by ordered delivery
#[derive(Debug, Default)]
pub struct RocketProjection {
    rockets: DashMap<String, RocketState>,
}

impl RocketProjection {
    /// Create empty projection
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one delivered message
    ///
    /// A repeat of the last applied number is accepted as a no-op. Anything
    /// else that is not `last_applied + 1` is refused.
    pub fn apply_message(&self, message: &SequencedMessage) -> Result<(), RocketError> {
        let channel = message.key.as_str();
        let received = message.message_number;
        let last_applied = self
            .rockets
            .get(channel)
            .map(|state| state.last_applied)
            .unwrap_or(0);

        match received.cmp(&(last_applied + 1)) {
            Ordering::Equal => {}
            Ordering::Less if received == last_applied => {
                debug!(channel, seq = received, "Repeat of last applied message");
                return Ok(());
            }
            Ordering::Less => {
                return Err(RocketError::SequenceRegression {
                    channel: channel.to_string(),
                    last_applied,
                    received,
                })
            }
            Ordering::Greater => {
                return Err(RocketError::SequenceGap {
                    channel: channel.to_string(),
                    last_applied,
                    received,
                })
            }
        }

        let event = RocketEvent::parse(&message.message_type, &message.payload)?;
        let name = event.name();

        let mut state = self
            .rockets
            .entry(channel.to_string())
            .or_insert_with(|| {
                info!(channel, "Rocket created");
                RocketState::new(channel)
            });

        if state.apply(event)? {
            debug!(channel, seq = received, event = name, "Applied event");
        } else {
            debug!(channel, seq = received, event = name, "Rocket exploded, ignoring event");
        }
        state.last_applied = received;
        Ok(())
    }

    /// State of one rocket
    pub fn get(&self, channel: &str) -> Option<RocketState> {
        self.rockets.get(channel).map(|state| state.value().clone())
    }

    /// All rockets, sorted
    pub fn all(&self, sort: SortField, order: SortOrder) -> Vec<RocketState> {
        let mut rockets: Vec<RocketState> =
            self.rockets.iter().map(|r| r.value().clone()).collect();
        rockets.sort_by(|a, b| {
            let primary = match sort {
                SortField::Channel => Ordering::Equal,
                SortField::Speed => a.speed.cmp(&b.speed),
                SortField::Type => a.rocket_type.cmp(&b.rocket_type),
                SortField::Mission => a.mission.cmp(&b.mission),
                SortField::Status => a.status.cmp(&b.status),
            };
            primary.then_with(|| a.channel.cmp(&b.channel))
        });
        if order == SortOrder::Desc {
            rockets.reverse();
        }
        rockets
    }

    /// Rockets tracked
    pub fn len(&self) -> usize {
        self.rockets.len()
    }

    /// True when no rocket was seen
    pub fn is_empty(&self) -> bool {
        self.rockets.is_empty()
    }
}

#[async_trait]
impl OrderedSink for RocketProjection {
    async fn deliver(&self, message: &SequencedMessage) -> sequencer_core::Result<()> {
        Ok(self.apply_message(message)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn message(channel: &str, n: u64, message_type: &str, payload: Value) -> SequencedMessage {
        SequencedMessage::new(channel, n, message_type, Utc::now(), payload)
    }

    fn launch(channel: &str, n: u64) -> SequencedMessage {
        message(
            channel,
            n,
            "RocketLaunched",
            json!({"type": "Falcon-9", "launchSpeed": 500, "mission": "ARTEMIS"}),
        )
    }

    #[test]
    fn test_parse_all_event_types() {
        assert_eq!(
            RocketEvent::parse("RocketSpeedIncreased", &json!({"by": 3000})).unwrap(),
            RocketEvent::SpeedIncreased { by: 3000 }
        );
        assert_eq!(
            RocketEvent::parse("RocketMissionChanged", &json!({"newMission": "SHUTTLE_MIR"}))
                .unwrap(),
            RocketEvent::MissionChanged {
                new_mission: "SHUTTLE_MIR".to_string()
            }
        );
        assert!(matches!(
            RocketEvent::parse("RocketLaunched", &json!({"type": "Falcon-9", "launchSpeed": 500, "mission": "ARTEMIS"})),
            Ok(RocketEvent::Launched { launch_speed: 500, .. })
        ));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            RocketEvent::parse("RocketRefueled", &json!({})),
            Err(RocketError::UnknownEventType("RocketRefueled".to_string()))
        );
        assert_eq!(
            RocketEvent::parse("RocketSpeedDecreased", &json!({"by": "fast"})),
            Err(RocketError::MissingField {
                field: "by",
                event_type: "RocketSpeedDecreased"
            })
        );
    }

    #[test]
    fn test_projection_folds_events() {
        let projection = RocketProjection::new();
        projection.apply_message(&launch("r1", 1)).unwrap();
        projection
            .apply_message(&message("r1", 2, "RocketSpeedIncreased", json!({"by": 100})))
            .unwrap();
        projection
            .apply_message(&message("r1", 3, "RocketSpeedIncreased", json!({"by": 200})))
            .unwrap();

        let rocket = projection.get("r1").unwrap();
        assert_eq!(rocket.speed, 800);
        assert_eq!(rocket.rocket_type, "Falcon-9");
        assert_eq!(rocket.last_applied, 3);
    }

    #[test]
    fn test_exploded_rocket_ignores_all_but_launch() {
        let projection = RocketProjection::new();
        projection.apply_message(&launch("r1", 1)).unwrap();
        projection
            .apply_message(&message("r1", 2, "RocketExploded", json!({"reason": "PRESSURE_VESSEL_FAILURE"})))
            .unwrap();
        projection
            .apply_message(&message("r1", 3, "RocketSpeedIncreased", json!({"by": 100})))
            .unwrap();

        let rocket = projection.get("r1").unwrap();
        assert_eq!(rocket.status, RocketStatus::Exploded);
        assert_eq!(rocket.speed, 500);
        assert_eq!(rocket.last_applied, 3);

        projection.apply_message(&launch("r1", 4)).unwrap();
        assert_eq!(projection.get("r1").unwrap().status, RocketStatus::Launched);
    }

    #[test]
    fn test_projection_refuses_gaps_and_regressions() {
        let projection = RocketProjection::new();
        assert!(matches!(
            projection.apply_message(&launch("r1", 2)),
            Err(RocketError::SequenceGap { received: 2, .. })
        ));
        assert!(projection.is_empty());

        projection.apply_message(&launch("r1", 1)).unwrap();
        projection
            .apply_message(&message("r1", 2, "RocketSpeedIncreased", json!({"by": 1})))
            .unwrap();
        // Repeat of the last one is tolerated
        projection
            .apply_message(&message("r1", 2, "RocketSpeedIncreased", json!({"by": 1})))
            .unwrap();
        assert_eq!(projection.get("r1").unwrap().speed, 501);

        assert!(matches!(
            projection.apply_message(&launch("r1", 1)),
            Err(RocketError::SequenceRegression { received: 1, .. })
        ));
    }

    #[test]
    fn test_speed_overflow_is_refused() {
        let projection = RocketProjection::new();
        projection
            .apply_message(&message(
                "r1",
                1,
                "RocketLaunched",
                json!({"type": "Falcon-9", "launchSpeed": i64::MAX, "mission": "ARTEMIS"}),
            ))
            .unwrap();

        let err = projection
            .apply_message(&message("r1", 2, "RocketSpeedIncreased", json!({"by": 1})))
            .unwrap_err();
        assert!(matches!(err, RocketError::SpeedOutOfRange { op: '+', .. }));

        let rocket = projection.get("r1").unwrap();
        assert_eq!(rocket.speed, i64::MAX);
        assert_eq!(rocket.last_applied, 1);
    }

    #[test]
    fn test_error_retry_classification() {
        let rejected: sequencer_core::Error =
            RocketError::UnknownEventType("RocketRefueled".to_string()).into();
        assert!(!rejected.is_retryable());

        let gap: sequencer_core::Error = RocketError::SequenceGap {
            channel: "r1".to_string(),
            last_applied: 1,
            received: 3,
        }
        .into();
        assert!(gap.is_retryable());
    }

    #[test]
    fn test_all_sorted() {
        let projection = RocketProjection::new();
        projection.apply_message(&launch("b", 1)).unwrap();
        projection.apply_message(&launch("a", 1)).unwrap();
        projection
            .apply_message(&message("a", 2, "RocketSpeedIncreased", json!({"by": 10})))
            .unwrap();

        let by_channel: Vec<String> = projection
            .all(SortField::from_param(None), SortOrder::from_param(None))
            .into_iter()
            .map(|r| r.channel)
            .collect();
        assert_eq!(by_channel, vec!["a", "b"]);

        let by_speed_desc = projection.all(
            SortField::from_param(Some("SPEED")),
            SortOrder::from_param(Some("desc")),
        );
        assert_eq!(by_speed_desc[0].channel, "a");
        assert_eq!(by_speed_desc[0].speed, 510);
    }

    #[test]
    fn test_state_serializes_like_api() {
        let mut state = RocketState::new("r1");
        state
            .apply(RocketEvent::Exploded {
                reason: "boom".to_string(),
            })
            .unwrap();
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["status"], "exploded");
        assert_eq!(value["explosion_reason"], "boom");
        assert!(value.get("type").is_some());
    }
}
