use anyhow::{Context, Result};
use score_record_core::{
    assemble_course_record, AssessmentLevel, CourseRecord, EventRecord, GradedScoreNode,
    NoopRollup, RollupService, ScoreNode, TaskScoreNode,
};
use sha2::{Digest, Sha256};

pub const API_CONTRACT_VERSION: &str = "api.v1";

/// Bottom-up assessment propagation: every graded-kind node without an
/// explicit assessment takes the worst known assessment among its
/// children. `Unknown` is ignored wherever a sibling carries a known
/// level, and a node with nothing to aggregate resolves to `Unknown`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssessmentRollup;

impl RollupService for AssessmentRollup {
    fn rollup(&self, root: ScoreNode, bottom_up: bool) -> ScoreNode {
        if bottom_up {
            roll_bottom_up(root)
        } else {
            root
        }
    }
}

fn aggregate(children: &[ScoreNode]) -> AssessmentLevel {
    let mut worst_known: Option<AssessmentLevel> = None;
    for child in children {
        match child.assessment() {
            Some(AssessmentLevel::Unknown) | None => {}
            Some(level) => {
                worst_known = Some(match worst_known {
                    Some(current) if current.rank() <= level.rank() => current,
                    _ => level,
                });
            }
        }
    }
    worst_known.unwrap_or(AssessmentLevel::Unknown)
}

fn roll_bottom_up(node: ScoreNode) -> ScoreNode {
    match node {
        ScoreNode::Raw(raw) => ScoreNode::Raw(raw),
        ScoreNode::Graded(graded) => ScoreNode::Graded(roll_graded(graded)),
        ScoreNode::Task(task) => ScoreNode::Task(TaskScoreNode {
            node: roll_graded(task.node),
            ..task
        }),
    }
}

fn roll_graded(graded: GradedScoreNode) -> GradedScoreNode {
    let children = graded.children.into_iter().map(roll_bottom_up).collect::<Vec<_>>();
    let assessment = match graded.assessment {
        Some(level) => Some(level),
        None => Some(aggregate(&children)),
    };
    GradedScoreNode { assessment, children, ..graded }
}

/// Deserialize an event stream from JSON.
///
/// # Errors
/// Fails when the input is not a JSON array of event records.
pub fn read_events_json(input: &str) -> Result<Vec<EventRecord>> {
    serde_json::from_str::<Vec<EventRecord>>(input)
        .context("events input must be a JSON array of event records")
}

/// Assemble a course record from an ordered event stream, running the
/// default bottom-up assessment rollup unless `with_rollup` is false.
/// A record without a caller-supplied reference id receives a
/// deterministic digest-derived one.
///
/// # Errors
/// Propagates every reconstruction failure; no partial record is returned.
pub fn derive_record(events: &[EventRecord], with_rollup: bool) -> Result<Option<CourseRecord>> {
    let assembled = if with_rollup {
        assemble_course_record(events, &AssessmentRollup)
    } else {
        assemble_course_record(events, &NoopRollup)
    };

    let Some(mut record) = assembled.context("course record assembly failed")? else {
        return Ok(None);
    };

    if record.reference_id.is_none() {
        record.reference_id = Some(compute_record_id(&record));
    }
    Ok(Some(record))
}

/// Stable record id: Sha256 over course name, event timestamp, and source
/// event id, truncated to 16 hex chars.
#[must_use]
pub fn compute_record_id(record: &CourseRecord) -> String {
    let mut hasher = Sha256::new();
    hasher.update(record.course_name.as_bytes());
    hasher.update(record.event_timestamp.unix_timestamp().to_string().as_bytes());
    hasher.update(record.source_event_id.as_bytes());
    let digest = hasher.finalize();
    let digest_hex = format!("{digest:x}");
    format!("crs_{}", &digest_hex[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use score_record_core::{RawScore, RawScoreNode};

    fn raw_leaf(name: &str, user: &str, assessment: Option<AssessmentLevel>) -> ScoreNode {
        ScoreNode::Raw(RawScoreNode {
            name: name.to_string(),
            full_name: None,
            performance_node_id: None,
            usernames: BTreeSet::from([user.to_string()]),
            score: RawScore { value: "1".to_string(), units: "score".to_string() },
            assessment,
        })
    }

    fn graded(name: &str, children: Vec<ScoreNode>) -> ScoreNode {
        ScoreNode::Graded(GradedScoreNode {
            name: name.to_string(),
            full_name: None,
            performance_node_id: None,
            assessment: None,
            children,
        })
    }

    const EVENTS_JSON: &str = r#"[
      {
        "event_id": "evt-1",
        "leaf": { "id": "c1", "display_name": "Navigate" },
        "ancestors": { "0": { "id": "m", "display_name": "Mission" } },
        "measurement": {
          "usernames": ["alice"],
          "value": "1",
          "units": "score",
          "assessment": "below_expectation"
        },
        "timestamp": "2024-01-15T10:30:00Z",
        "course": { "course_name": "Land Navigation", "reference_id": null }
      },
      {
        "event_id": "evt-2",
        "leaf": { "id": "c2", "display_name": "Communicate" },
        "ancestors": { "0": { "id": "m", "display_name": "Mission" } },
        "measurement": {
          "usernames": ["bob"],
          "value": "2",
          "units": "score",
          "assessment": "at_expectation"
        },
        "timestamp": "2024-01-15T10:31:00Z",
        "course": { "course_name": "Land Navigation", "reference_id": null }
      }
    ]"#;

    // Test IDs: TAPI-001
    #[test]
    fn rollup_takes_worst_known_child_assessment() {
        let tree = graded(
            "Mission",
            vec![
                graded(
                    "Navigate",
                    vec![raw_leaf("Navigate", "alice", Some(AssessmentLevel::BelowExpectation))],
                ),
                graded(
                    "Communicate",
                    vec![raw_leaf("Communicate", "bob", Some(AssessmentLevel::AboveExpectation))],
                ),
            ],
        );

        let rolled = AssessmentRollup.rollup(tree, true);
        assert_eq!(rolled.assessment(), Some(AssessmentLevel::BelowExpectation));
        assert_eq!(
            rolled.children()[0].assessment(),
            Some(AssessmentLevel::BelowExpectation)
        );
        assert_eq!(
            rolled.children()[1].assessment(),
            Some(AssessmentLevel::AboveExpectation)
        );
    }

    // Test IDs: TAPI-002
    #[test]
    fn rollup_ignores_unknown_when_known_sibling_exists() {
        let tree = graded(
            "Mission",
            vec![
                raw_leaf("A", "alice", Some(AssessmentLevel::Unknown)),
                raw_leaf("B", "bob", Some(AssessmentLevel::AtExpectation)),
            ],
        );
        let rolled = AssessmentRollup.rollup(tree, true);
        assert_eq!(rolled.assessment(), Some(AssessmentLevel::AtExpectation));

        let bare = graded("Empty", Vec::new());
        let rolled = AssessmentRollup.rollup(bare, true);
        assert_eq!(rolled.assessment(), Some(AssessmentLevel::Unknown));
    }

    // Test IDs: TAPI-003
    #[test]
    fn rollup_respects_bottom_up_flag_and_explicit_assessments() {
        let tree = ScoreNode::Graded(GradedScoreNode {
            name: "Mission".to_string(),
            full_name: None,
            performance_node_id: None,
            assessment: Some(AssessmentLevel::AboveExpectation),
            children: vec![raw_leaf("A", "alice", Some(AssessmentLevel::BelowExpectation))],
        });

        let untouched = AssessmentRollup.rollup(tree.clone(), false);
        assert_eq!(untouched, tree);

        let rolled = AssessmentRollup.rollup(tree, true);
        assert_eq!(rolled.assessment(), Some(AssessmentLevel::AboveExpectation));
    }

    // Test IDs: TAPI-004
    #[test]
    fn derive_record_parses_events_and_fills_reference_id() -> Result<()> {
        let events = read_events_json(EVENTS_JSON)?;
        let record = derive_record(&events, true)?
            .context("two events must produce a record")?;

        assert_eq!(record.course_name, "Land Navigation");
        assert_eq!(record.source_event_id, "evt-1");
        assert_eq!(record.root.children().len(), 2);
        assert_eq!(record.root.assessment(), Some(AssessmentLevel::BelowExpectation));

        let reference_id = record.reference_id.context("reference id must be filled")?;
        assert!(reference_id.starts_with("crs_"));
        assert_eq!(reference_id.len(), 20);

        // Deterministic across repeated derivations.
        let again = derive_record(&events, true)?
            .context("two events must produce a record")?;
        assert_eq!(again.reference_id.as_deref(), Some(reference_id.as_str()));
        Ok(())
    }

    // Test IDs: TAPI-005
    #[test]
    fn derive_record_without_rollup_leaves_assessments_unset() -> Result<()> {
        let events = read_events_json(EVENTS_JSON)?;
        let record = derive_record(&events, false)?
            .context("two events must produce a record")?;
        assert_eq!(record.root.assessment(), None);
        Ok(())
    }

    // Test IDs: TAPI-006
    #[test]
    fn derive_record_of_empty_stream_is_none() -> Result<()> {
        assert!(derive_record(&[], true)?.is_none());
        Ok(())
    }

    // Test IDs: TAPI-007
    #[test]
    fn read_events_json_rejects_non_arrays() {
        let err = match read_events_json("{}") {
            Err(err) => err,
            Ok(events) => panic!("expected a parse failure, got {events:?}"),
        };
        assert!(err.to_string().contains("JSON array"));
    }
}
