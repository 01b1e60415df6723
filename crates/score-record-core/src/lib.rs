use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Upper bound on ancestor-chain depth accepted from a single event.
/// Course hierarchies are authored, not adversarial, but a corrupt event
/// could claim unbounded depth and blow the recursive merge stack.
pub const MAX_HIERARCHY_DEPTH: usize = 32;

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ScoreError {
    #[error("malformed event at index {index}: {reason}")]
    MalformedEvent { index: usize, reason: String },
    #[error("ancestor chain of event at index {index} is invalid: {reason}")]
    AncestorChain { index: usize, reason: String },
    #[error("ancestor chain of event at index {index} has depth {depth}, exceeding the hierarchy depth limit")]
    DepthExceeded { index: usize, depth: usize },
    #[error("cannot rebase unrelated trees: trunk root is '{trunk}', branch root is '{branch}'")]
    RootMismatch { trunk: String, branch: String },
    #[error("path '{path}' from event at index {index} does not resolve within the trunk")]
    PathNotFound { index: usize, path: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AssessmentLevel {
    Unknown,
    BelowExpectation,
    AtExpectation,
    AboveExpectation,
}

impl AssessmentLevel {
    /// Aggregation rank. `Unknown` ranks lowest but is ignored by rollup
    /// whenever a sibling carries a known level.
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::BelowExpectation => 1,
            Self::AtExpectation => 2,
            Self::AboveExpectation => 3,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::BelowExpectation => "below_expectation",
            Self::AtExpectation => "at_expectation",
            Self::AboveExpectation => "above_expectation",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "unknown" => Some(Self::Unknown),
            "below_expectation" => Some(Self::BelowExpectation),
            "at_expectation" => Some(Self::AtExpectation),
            "above_expectation" => Some(Self::AboveExpectation),
            _ => None,
        }
    }
}

/// A string-encoded numeric measurement with its units label.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RawScore {
    pub value: String,
    pub units: String,
}

/// Leaf measurement node. More than one username means a team measurement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawScoreNode {
    pub name: String,
    pub full_name: Option<String>,
    pub performance_node_id: Option<i64>,
    pub usernames: BTreeSet<String>,
    pub score: RawScore,
    pub assessment: Option<AssessmentLevel>,
}

impl RawScoreNode {
    #[must_use]
    pub fn is_team(&self) -> bool {
        self.usernames.len() > 1
    }
}

/// Interior (or not-yet-populated leaf) concept node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GradedScoreNode {
    pub name: String,
    pub full_name: Option<String>,
    pub performance_node_id: Option<i64>,
    pub assessment: Option<AssessmentLevel>,
    #[serde(default)]
    pub children: Vec<ScoreNode>,
}

/// Graded specialization carrying per-task condition metrics. Any subset of
/// the four metric fields may be absent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskScoreNode {
    #[serde(flatten)]
    pub node: GradedScoreNode,
    pub stress: Option<f64>,
    pub stress_reason: Option<String>,
    pub difficulty: Option<f64>,
    pub difficulty_reason: Option<String>,
}

/// The score tree. Raw nodes are always leaves; graded and task nodes carry
/// an ordered child list whose order is display-only, never merge-relevant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScoreNode {
    Raw(RawScoreNode),
    Graded(GradedScoreNode),
    Task(TaskScoreNode),
}

impl ScoreNode {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Raw(raw) => &raw.name,
            Self::Graded(graded) => &graded.name,
            Self::Task(task) => &task.node.name,
        }
    }

    #[must_use]
    pub fn full_name(&self) -> Option<&str> {
        match self {
            Self::Raw(raw) => raw.full_name.as_deref(),
            Self::Graded(graded) => graded.full_name.as_deref(),
            Self::Task(task) => task.node.full_name.as_deref(),
        }
    }

    #[must_use]
    pub fn performance_node_id(&self) -> Option<i64> {
        match self {
            Self::Raw(raw) => raw.performance_node_id,
            Self::Graded(graded) => graded.performance_node_id,
            Self::Task(task) => task.node.performance_node_id,
        }
    }

    /// The shared graded shell for graded-kind nodes, `None` for raw leaves.
    #[must_use]
    pub fn graded(&self) -> Option<&GradedScoreNode> {
        match self {
            Self::Raw(_) => None,
            Self::Graded(graded) => Some(graded),
            Self::Task(task) => Some(&task.node),
        }
    }

    #[must_use]
    pub fn children(&self) -> &[ScoreNode] {
        self.graded().map_or(&[], |graded| graded.children.as_slice())
    }

    /// Leaf for merge purposes: a raw node, or a graded-kind node with an
    /// empty child list.
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.children().is_empty()
    }

    #[must_use]
    pub fn assessment(&self) -> Option<AssessmentLevel> {
        match self {
            Self::Raw(raw) => raw.assessment,
            Self::Graded(graded) => graded.assessment,
            Self::Task(task) => task.node.assessment,
        }
    }
}

/// Identifier plus display name for one concept in the authored hierarchy.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NodeDescriptor {
    pub id: String,
    pub display_name: String,
}

/// Per-event metadata marking a concept as a task, with whatever condition
/// metrics the evaluation captured.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskCharacteristic {
    pub descriptor_id: String,
    pub stress: Option<f64>,
    pub stress_reason: Option<String>,
    pub difficulty: Option<f64>,
    pub difficulty_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Measurement {
    pub usernames: BTreeSet<String>,
    pub value: String,
    pub units: String,
    pub assessment: Option<AssessmentLevel>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CourseIdentifiers {
    pub course_name: String,
    pub reference_id: Option<String>,
}

/// One externally-sourced observation of a single evaluated leaf concept,
/// already deserialized by the transport layer. `ancestors` maps depth to
/// descriptor, index 0 being the hierarchy root and the highest index the
/// leaf concept's immediate parent. `node_ids` maps descriptor id to the
/// authoring hierarchy's stable integer identity, when supplied.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventRecord {
    pub event_id: String,
    pub leaf: NodeDescriptor,
    #[serde(default)]
    pub ancestors: Option<BTreeMap<usize, NodeDescriptor>>,
    #[serde(default)]
    pub task_characteristics: Option<Vec<TaskCharacteristic>>,
    #[serde(default)]
    pub node_ids: Option<BTreeMap<String, i64>>,
    pub measurement: Measurement,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub course: CourseIdentifiers,
}

/// The assembled outcome handed to whatever persists or transmits it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CourseRecord {
    pub reference_id: Option<String>,
    pub course_name: String,
    pub root: ScoreNode,
    #[serde(with = "time::serde::rfc3339")]
    pub event_timestamp: OffsetDateTime,
    pub source_event_id: String,
}

/// External aggregate-assessment propagation, invoked exactly once per
/// assembly as a terminal step.
pub trait RollupService {
    fn rollup(&self, root: ScoreNode, bottom_up: bool) -> ScoreNode;
}

/// Pass-through rollup for callers that want reconstruction only.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRollup;

impl RollupService for NoopRollup {
    fn rollup(&self, root: ScoreNode, _bottom_up: bool) -> ScoreNode {
        root
    }
}

/// Extract the ordered ancestor chain, root first, from one event.
///
/// An absent or empty mapping means the leaf concept is itself the root.
/// Indices must be exactly `0..len`; anything else is a hard error, never a
/// guess.
///
/// # Errors
/// Returns [`ScoreError::AncestorChain`] on non-contiguous indices and
/// [`ScoreError::DepthExceeded`] above [`MAX_HIERARCHY_DEPTH`].
pub fn parse_ancestor_chain(
    event: &EventRecord,
    index: usize,
) -> Result<Vec<NodeDescriptor>, ScoreError> {
    let Some(mapping) = &event.ancestors else {
        return Ok(Vec::new());
    };

    if mapping.len() > MAX_HIERARCHY_DEPTH {
        return Err(ScoreError::DepthExceeded { index, depth: mapping.len() });
    }

    let mut chain = Vec::with_capacity(mapping.len());
    for (position, (depth, descriptor)) in mapping.iter().enumerate() {
        if *depth != position {
            return Err(ScoreError::AncestorChain {
                index,
                reason: format!("expected contiguous depth {position}, found {depth}"),
            });
        }
        chain.push(descriptor.clone());
    }
    Ok(chain)
}

fn performance_node_id(event: &EventRecord, descriptor: &NodeDescriptor) -> Option<i64> {
    event.node_ids.as_ref().and_then(|ids| ids.get(&descriptor.id).copied())
}

fn task_characteristic<'a>(
    event: &'a EventRecord,
    descriptor: &NodeDescriptor,
) -> Option<&'a TaskCharacteristic> {
    event
        .task_characteristics
        .as_ref()
        .and_then(|entries| entries.iter().find(|entry| entry.descriptor_id == descriptor.id))
}

/// Build the leaf [`RawScoreNode`] from one event's own measurement.
///
/// # Errors
/// Returns [`ScoreError::MalformedEvent`] when `usernames` is empty or the
/// raw value is not a string-encoded number.
pub fn build_raw_leaf(event: &EventRecord, index: usize) -> Result<RawScoreNode, ScoreError> {
    if event.measurement.usernames.is_empty() {
        return Err(ScoreError::MalformedEvent {
            index,
            reason: "measurement usernames MUST be non-empty".to_string(),
        });
    }

    if event.measurement.value.trim().parse::<f64>().is_err() {
        return Err(ScoreError::MalformedEvent {
            index,
            reason: format!(
                "raw value '{}' MUST be a string-encoded number",
                event.measurement.value
            ),
        });
    }

    if event.leaf.display_name.trim().is_empty() {
        return Err(ScoreError::MalformedEvent {
            index,
            reason: "leaf descriptor display name MUST be non-empty".to_string(),
        });
    }

    Ok(RawScoreNode {
        name: event.leaf.display_name.clone(),
        full_name: None,
        performance_node_id: performance_node_id(event, &event.leaf),
        usernames: event.measurement.usernames.clone(),
        score: RawScore {
            value: event.measurement.value.clone(),
            units: event.measurement.units.clone(),
        },
        assessment: event.measurement.assessment,
    })
}

fn build_wrapper(
    event: &EventRecord,
    descriptor: &NodeDescriptor,
    full_name: String,
    children: Vec<ScoreNode>,
) -> ScoreNode {
    let graded = GradedScoreNode {
        name: descriptor.display_name.clone(),
        full_name: Some(full_name),
        performance_node_id: performance_node_id(event, descriptor),
        assessment: None,
        children,
    };

    match task_characteristic(event, descriptor) {
        Some(characteristic) => ScoreNode::Task(TaskScoreNode {
            node: graded,
            stress: characteristic.stress,
            stress_reason: characteristic.stress_reason.clone(),
            difficulty: characteristic.difficulty,
            difficulty_reason: characteristic.difficulty_reason.clone(),
        }),
        None => ScoreNode::Graded(graded),
    }
}

/// Construct the root-to-leaf branch implied by one event: the raw leaf,
/// its graded (or task) wrapper, then one wrapper per ancestor from
/// nearest parent outward to the root, each holding the previous node as
/// its sole child.
///
/// # Errors
/// Propagates [`parse_ancestor_chain`] and [`build_raw_leaf`] failures;
/// the caller treats any of them as fatal for the whole assembly.
pub fn build_branch(event: &EventRecord, index: usize) -> Result<ScoreNode, ScoreError> {
    let chain = parse_ancestor_chain(event, index)?;
    let raw = build_raw_leaf(event, index)?;

    let mut prefix = chain
        .iter()
        .map(|descriptor| descriptor.display_name.as_str())
        .collect::<Vec<_>>();
    prefix.push(event.leaf.display_name.as_str());

    let mut node = build_wrapper(event, &event.leaf, prefix.join("|"), vec![ScoreNode::Raw(raw)]);

    for (depth, descriptor) in chain.iter().enumerate().rev() {
        let full_name = prefix[..=depth].join("|");
        node = build_wrapper(event, descriptor, full_name, vec![node]);
    }

    Ok(node)
}

fn same_base(lhs: &ScoreNode, rhs: &ScoreNode) -> bool {
    lhs.name() == rhs.name()
        && lhs.performance_node_id() == rhs.performance_node_id()
        && lhs.full_name() == rhs.full_name()
}

/// Shallow identity: same kind, same case-sensitive name, same
/// `performance_node_id` and `full_name` (both-absent counts as equal).
/// A task and a plain graded node are never shallow-equal; the type
/// distinction is load-bearing for tree identity.
#[must_use]
pub fn is_same_node_shallow(lhs: &ScoreNode, rhs: &ScoreNode) -> bool {
    match (lhs, rhs) {
        (ScoreNode::Raw(_), ScoreNode::Raw(_))
        | (ScoreNode::Graded(_), ScoreNode::Graded(_))
        | (ScoreNode::Task(_), ScoreNode::Task(_)) => same_base(lhs, rhs),
        _ => false,
    }
}

/// Strict structural equality: shallow plus every kind-specific field, with
/// graded children compared order-independently at equal cardinality.
#[must_use]
pub fn is_same_node(lhs: &ScoreNode, rhs: &ScoreNode) -> bool {
    if !is_same_node_shallow(lhs, rhs) {
        return false;
    }

    match (lhs, rhs) {
        (ScoreNode::Raw(a), ScoreNode::Raw(b)) => {
            a.usernames == b.usernames && a.assessment == b.assessment && a.score == b.score
        }
        (ScoreNode::Task(a), ScoreNode::Task(b)) => {
            a.stress == b.stress
                && a.stress_reason == b.stress_reason
                && a.difficulty == b.difficulty
                && a.difficulty_reason == b.difficulty_reason
                && same_graded_strict(&a.node, &b.node)
        }
        (ScoreNode::Graded(a), ScoreNode::Graded(b)) => same_graded_strict(a, b),
        _ => false,
    }
}

fn same_graded_strict(lhs: &GradedScoreNode, rhs: &GradedScoreNode) -> bool {
    lhs.assessment == rhs.assessment
        && lhs.children.len() == rhs.children.len()
        && lhs
            .children
            .iter()
            .all(|child| find_node_strict(&rhs.children, child).is_some())
}

/// Correspondence: the same underlying raw measurement slot across two
/// trees. Shallow-equal raw nodes with equal usernames and units label,
/// deliberately ignoring the value so a re-reported measurement resolves
/// to its existing slot rather than a new sibling.
#[must_use]
pub fn is_corresponding_raw(lhs: &RawScoreNode, rhs: &RawScoreNode) -> bool {
    lhs.name == rhs.name
        && lhs.performance_node_id == rhs.performance_node_id
        && lhs.full_name == rhs.full_name
        && lhs.usernames == rhs.usernames
        && lhs.score.units == rhs.score.units
}

/// First strict match for `target` within `nodes`, or `None`.
#[must_use]
pub fn find_node_strict<'a>(nodes: &'a [ScoreNode], target: &ScoreNode) -> Option<&'a ScoreNode> {
    nodes.iter().find(|candidate| is_same_node(candidate, target))
}

/// First corresponding raw measurement for `target` within `nodes`.
#[must_use]
pub fn find_corresponding_raw<'a>(
    nodes: &'a [ScoreNode],
    target: &RawScoreNode,
) -> Option<&'a RawScoreNode> {
    nodes.iter().find_map(|candidate| match candidate {
        ScoreNode::Raw(raw) if is_corresponding_raw(raw, target) => Some(raw),
        _ => None,
    })
}

fn with_children(node: &ScoreNode, children: Vec<ScoreNode>) -> ScoreNode {
    match node {
        ScoreNode::Raw(_) => node.clone(),
        ScoreNode::Graded(graded) => {
            ScoreNode::Graded(GradedScoreNode { children, ..graded.clone() })
        }
        ScoreNode::Task(task) => ScoreNode::Task(TaskScoreNode {
            node: GradedScoreNode { children, ..task.node.clone() },
            ..task.clone()
        }),
    }
}

/// Fold `branch` into `trunk`, producing a merged tree that is a superset
/// of both. Trunk precedence resolves every conflict: a shared same-named
/// raw leaf keeps trunk's copy, a shared task/graded classification
/// disagreement keeps trunk's classification, and the merged node carries
/// trunk's assessment and task metrics. Branch-unique subtrees are adopted
/// unchanged, which is how reconstruction discovers new structure across
/// events. The operation is therefore order-sensitive by design.
///
/// # Errors
/// Returns [`ScoreError::RootMismatch`] when the two roots do not share a
/// name; an unrelated tree cannot be rebased.
pub fn rebase(trunk: &ScoreNode, branch: &ScoreNode) -> Result<ScoreNode, ScoreError> {
    if trunk.name() != branch.name() {
        return Err(ScoreError::RootMismatch {
            trunk: trunk.name().to_string(),
            branch: branch.name().to_string(),
        });
    }
    Ok(merge_nodes(trunk, branch))
}

/// Recursive merge step. Callers guarantee graded-kind inputs except in
/// the defensive both-leaf arm; a raw trunk is returned unchanged.
fn merge_nodes(trunk: &ScoreNode, branch: &ScoreNode) -> ScoreNode {
    if matches!(trunk, ScoreNode::Raw(_)) {
        return trunk.clone();
    }

    let trunk_children = trunk.children();
    let branch_children = branch.children();

    match (trunk_children.is_empty(), branch_children.is_empty()) {
        // Branch extends a previously-incomplete trunk node.
        (true, false) => with_children(trunk, branch_children.to_vec()),
        // Branch is an incomplete or older view; trunk keeps its structure.
        (false, true) => trunk.clone(),
        (true, true) => {
            if trunk.name() == branch.name() {
                trunk.clone()
            } else {
                // Defensive arm: two leaf concepts sharing an ancestor name
                // but not a name of their own get a synthesized parent.
                with_children(trunk, vec![trunk.clone(), branch.clone()])
            }
        }
        (false, false) => {
            let trunk_names =
                trunk_children.iter().map(ScoreNode::name).collect::<BTreeSet<_>>();

            let mut merged = Vec::with_capacity(trunk_children.len());
            for trunk_child in trunk_children {
                let shared = branch_children
                    .iter()
                    .find(|candidate| candidate.name() == trunk_child.name());
                match shared {
                    Some(branch_child)
                        if trunk_child.graded().is_some() && branch_child.graded().is_some() =>
                    {
                        merged.push(merge_nodes(trunk_child, branch_child));
                    }
                    // Shared raw leaf: trunk's copy wins outright.
                    Some(_) | None => merged.push(trunk_child.clone()),
                }
            }

            for branch_child in branch_children {
                if !trunk_names.contains(branch_child.name()) {
                    merged.push(branch_child.clone());
                }
            }

            with_children(trunk, merged)
        }
    }
}

/// Ancestor display names plus the leaf concept name, root first, joined
/// with `|`. Keys the assembler's seen-path bookkeeping and the sibling
/// append walk.
///
/// # Errors
/// Propagates [`parse_ancestor_chain`] failures.
pub fn path_signature(event: &EventRecord, index: usize) -> Result<String, ScoreError> {
    let chain = parse_ancestor_chain(event, index)?;
    let mut segments = chain
        .iter()
        .map(|descriptor| descriptor.display_name.as_str())
        .collect::<Vec<_>>();
    segments.push(event.leaf.display_name.as_str());
    Ok(segments.join("|"))
}

fn append_at_path(node: &ScoreNode, segments: &[&str], raw: &RawScoreNode) -> Option<ScoreNode> {
    let (first, rest) = segments.split_first()?;
    if node.name() != *first {
        return None;
    }

    if rest.is_empty() {
        let mut children = node.children().to_vec();
        children.push(ScoreNode::Raw(raw.clone()));
        return Some(with_children(node, children));
    }

    let mut children = node.children().to_vec();
    for child in &mut children {
        if child.graded().is_some() && child.name() == rest[0] {
            *child = append_at_path(child, rest, raw)?;
            return Some(with_children(node, children));
        }
    }
    None
}

/// Fold an ordered event stream into one canonical course record.
///
/// Each event either seeds the trunk, rebases a freshly built branch into
/// it, or, when its concept path was already seen, appends an additional
/// raw measurement as a sibling under the addressed node. Input order is
/// semantic: the merge policy is trunk-wins, so earlier events take
/// precedence on conflicts. The rollup collaborator runs exactly once
/// after the fold; record metadata comes from the first event. An empty
/// stream yields `Ok(None)`, a valid nothing-to-report outcome.
///
/// # Errors
/// Fails fast on any malformed event, ancestor-chain defect, root
/// mismatch, or seen-path walk that no longer resolves within the trunk.
/// No partial record is ever returned.
pub fn assemble_course_record<R: RollupService + ?Sized>(
    events: &[EventRecord],
    rollup: &R,
) -> Result<Option<CourseRecord>, ScoreError> {
    let Some(first) = events.first() else {
        return Ok(None);
    };

    let mut trunk: Option<ScoreNode> = None;
    let mut seen: BTreeSet<String> = BTreeSet::new();

    for (index, event) in events.iter().enumerate() {
        let signature = path_signature(event, index)?;
        let novel = !seen.contains(&signature);

        match (trunk.take(), novel) {
            (None, _) => {
                // Covers both the ordinary first event and the defensive
                // already-seen-but-empty-trunk fallback.
                trunk = Some(build_branch(event, index)?);
            }
            (Some(existing), true) => {
                let branch = build_branch(event, index)?;
                trunk = Some(rebase(&existing, &branch)?);
            }
            (Some(existing), false) => {
                let raw = build_raw_leaf(event, index)?;
                let segments = signature.split('|').collect::<Vec<_>>();
                let appended = append_at_path(&existing, &segments, &raw).ok_or_else(|| {
                    ScoreError::PathNotFound { index, path: signature.clone() }
                })?;
                trunk = Some(appended);
            }
        }

        seen.insert(signature);
    }

    let Some(root) = trunk else {
        return Ok(None);
    };

    Ok(Some(CourseRecord {
        reference_id: first.course.reference_id.clone(),
        course_name: first.course.course_name.clone(),
        root: rollup.rollup(root, true),
        event_timestamp: first.timestamp,
        source_event_id: first.event_id.clone(),
    }))
}

/// Flat reference-id reconciliation: survivors of `current` not named in
/// `invalidated`, unioned with `introduced`, deduplicated and sorted.
#[must_use]
pub fn reconcile_references(
    current: &[String],
    invalidated: &[String],
    introduced: &[String],
) -> BTreeSet<String> {
    let invalidated = invalidated.iter().collect::<BTreeSet<_>>();
    current
        .iter()
        .filter(|id| !invalidated.contains(id))
        .chain(introduced.iter())
        .cloned()
        .collect()
}
