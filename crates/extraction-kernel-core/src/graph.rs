use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::step::Step;
use crate::GraphError;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RevisionId(String);

impl RevisionId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn is_well_formed(&self) -> bool {
        !self.0.is_empty()
            && self
                .0
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
    }
}

impl From<&str> for RevisionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RevisionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for RevisionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "up" => Some(Self::Up),
            "down" => Some(Self::Down),
            _ => None,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How faithfully a revision's downgrade restores the prior schema.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reversibility {
    Exact,
    /// Structure is restored; some data is not (e.g. a dropped table comes back empty).
    Lossy { note: String },
    Irreversible { note: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Revision {
    pub id: RevisionId,
    pub predecessor: Option<RevisionId>,
    pub message: String,
    pub branch_label: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<RevisionId>,
    pub upgrade_steps: Vec<Step>,
    pub downgrade_steps: Vec<Step>,
    pub reversibility: Reversibility,
}

impl Revision {
    #[must_use]
    pub fn new(id: &str, predecessor: Option<&str>, message: &str) -> Self {
        Self {
            id: RevisionId::from(id),
            predecessor: predecessor.map(RevisionId::from),
            message: message.to_string(),
            branch_label: None,
            depends_on: Vec::new(),
            upgrade_steps: Vec::new(),
            downgrade_steps: Vec::new(),
            reversibility: Reversibility::Exact,
        }
    }

    #[must_use]
    pub fn branch(mut self, label: &str) -> Self {
        self.branch_label = Some(label.to_string());
        self
    }

    #[must_use]
    pub fn depends_on(mut self, revision: &str) -> Self {
        self.depends_on.push(RevisionId::from(revision));
        self
    }

    #[must_use]
    pub fn up(mut self, step: Step) -> Self {
        self.upgrade_steps.push(step);
        self
    }

    #[must_use]
    pub fn down(mut self, step: Step) -> Self {
        self.downgrade_steps.push(step);
        self
    }

    #[must_use]
    pub fn reversibility(mut self, reversibility: Reversibility) -> Self {
        self.reversibility = reversibility;
        self
    }

    #[must_use]
    pub fn steps(&self, direction: Direction) -> &[Step] {
        match direction {
            Direction::Up => &self.upgrade_steps,
            Direction::Down => &self.downgrade_steps,
        }
    }

    #[must_use]
    pub fn is_irreversible(&self) -> bool {
        matches!(self.reversibility, Reversibility::Irreversible { .. })
    }
}

/// Where a migration should end up.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum MigrationTarget {
    /// The single head of the graph.
    Head,
    Revision(RevisionId),
    /// Before the root revision; nothing applied.
    Base,
}

impl MigrationTarget {
    /// Parses `head`, `base`, or a revision id.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "head" | "heads" => Self::Head,
            "base" => Self::Base,
            other => Self::Revision(RevisionId::from(other)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PathStep<'g> {
    pub revision: &'g Revision,
    pub direction: Direction,
}

impl PathStep<'_> {
    /// Applied head once this step commits.
    #[must_use]
    pub fn head_after(&self) -> Option<&RevisionId> {
        match self.direction {
            Direction::Up => Some(&self.revision.id),
            Direction::Down => self.revision.predecessor.as_ref(),
        }
    }
}

/// Ordered walk between two points of the graph, all in one direction.
#[derive(Debug, Clone, Default)]
pub struct MigrationPath<'g> {
    steps: Vec<PathStep<'g>>,
}

impl<'g> MigrationPath<'g> {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PathStep<'g>> {
        self.steps.iter()
    }

    #[must_use]
    pub fn direction(&self) -> Option<Direction> {
        self.steps.first().map(|step| step.direction)
    }

    #[must_use]
    pub fn revision_ids(&self) -> Vec<&RevisionId> {
        self.steps.iter().map(|step| &step.revision.id).collect()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AuditFinding {
    pub revision: RevisionId,
    pub severity: AuditSeverity,
    pub message: String,
}

/// Validated revision graph. Nodes live in an arena; edges are parent indices.
#[derive(Debug, Clone)]
pub struct RevisionGraph {
    nodes: Vec<Revision>,
    index: BTreeMap<RevisionId, usize>,
    parents: Vec<Option<usize>>,
    /// Chain length back to the root, inclusive. The root has depth 1.
    depths: Vec<usize>,
    root: usize,
}

impl RevisionGraph {
    /// # Errors
    /// Returns [`GraphError`] when ids repeat, predecessors are missing, the graph does not have
    /// exactly one root, a cycle exists, a dependency is not an ancestor, or a step is malformed.
    pub fn new(revisions: Vec<Revision>) -> Result<Self, GraphError> {
        let mut index = BTreeMap::new();
        for (position, revision) in revisions.iter().enumerate() {
            if !revision.id.is_well_formed() {
                return Err(GraphError::InvalidRevision {
                    revision: revision.id.clone(),
                    reason: "revision ids are non-empty tokens of [A-Za-z0-9_-]".to_string(),
                });
            }
            if index.insert(revision.id.clone(), position).is_some() {
                return Err(GraphError::DuplicateRevision {
                    revision: revision.id.clone(),
                });
            }
        }

        let mut parents = Vec::with_capacity(revisions.len());
        for revision in &revisions {
            let parent = match &revision.predecessor {
                Some(predecessor) => match index.get(predecessor) {
                    Some(position) => Some(*position),
                    None => {
                        return Err(GraphError::MissingPredecessor {
                            revision: revision.id.clone(),
                            predecessor: predecessor.clone(),
                        })
                    }
                },
                None => None,
            };
            parents.push(parent);
        }

        let roots: Vec<usize> = parents
            .iter()
            .enumerate()
            .filter(|(_, parent)| parent.is_none())
            .map(|(position, _)| position)
            .collect();
        let root = match roots.as_slice() {
            [single] => *single,
            [] => {
                if let Some(first) = revisions.first() {
                    return Err(GraphError::Cycle {
                        revision: first.id.clone(),
                    });
                }
                return Err(GraphError::NoRoot);
            }
            many => {
                return Err(GraphError::MultipleRoots {
                    roots: many
                        .iter()
                        .map(|position| revisions[*position].id.clone())
                        .collect(),
                })
            }
        };

        let depths = node_depths(&revisions, &parents)?;
        let graph = Self {
            nodes: revisions,
            index,
            parents,
            depths,
            root,
        };

        graph.check_dependencies()?;
        graph.check_steps()?;

        Ok(graph)
    }

    fn check_dependencies(&self) -> Result<(), GraphError> {
        for (position, revision) in self.nodes.iter().enumerate() {
            for dependency in &revision.depends_on {
                let Some(target) = self.index.get(dependency) else {
                    return Err(GraphError::UnknownRevision {
                        revision: dependency.clone(),
                    });
                };
                if !self.is_ancestor(*target, position) {
                    return Err(GraphError::UnsatisfiedDependency {
                        revision: revision.id.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn check_steps(&self) -> Result<(), GraphError> {
        for revision in &self.nodes {
            if revision.is_irreversible() && !revision.downgrade_steps.is_empty() {
                return Err(GraphError::InvalidRevision {
                    revision: revision.id.clone(),
                    reason: "irreversible revision declares downgrade steps".to_string(),
                });
            }
            for direction in [Direction::Up, Direction::Down] {
                for (position, step) in revision.steps(direction).iter().enumerate() {
                    if let Err(err) = step.validate() {
                        return Err(GraphError::InvalidRevision {
                            revision: revision.id.clone(),
                            reason: format!("{direction} step #{}: {err}", position + 1),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Whether `ancestor` lies strictly above `position` on its chain to the root.
    fn is_ancestor(&self, ancestor: usize, position: usize) -> bool {
        let mut cursor = self.parents[position];
        while let Some(current) = cursor {
            if current == ancestor {
                return true;
            }
            if self.depths[current] <= self.depths[ancestor] {
                return false;
            }
            cursor = self.parents[current];
        }
        false
    }

    /// Indices from `start` back to the root, inclusive. Each node is visited once.
    fn ancestry_indices(&self, start: usize) -> Result<Vec<usize>, GraphError> {
        let mut chain = Vec::new();
        let mut visited = BTreeSet::new();
        let mut cursor = Some(start);
        while let Some(position) = cursor {
            if !visited.insert(position) {
                return Err(GraphError::Cycle {
                    revision: self.nodes[start].id.clone(),
                });
            }
            chain.push(position);
            cursor = self.parents[position];
        }
        Ok(chain)
    }

    fn position(&self, id: &RevisionId) -> Result<usize, GraphError> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| GraphError::UnknownRevision {
                revision: id.clone(),
            })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[must_use]
    pub fn get(&self, id: &RevisionId) -> Option<&Revision> {
        self.index.get(id).map(|position| &self.nodes[*position])
    }

    #[must_use]
    pub fn contains(&self, id: &RevisionId) -> bool {
        self.index.contains_key(id)
    }

    #[must_use]
    pub fn root(&self) -> &Revision {
        &self.nodes[self.root]
    }

    /// Revisions that no other revision names as predecessor.
    #[must_use]
    pub fn heads(&self) -> Vec<&Revision> {
        let referenced: BTreeSet<usize> = self.parents.iter().flatten().copied().collect();
        (0..self.nodes.len())
            .filter(|position| !referenced.contains(position))
            .map(|position| &self.nodes[position])
            .collect()
    }

    /// # Errors
    /// Returns [`GraphError::MultipleHeads`] when the graph has diverged.
    pub fn head(&self) -> Result<&Revision, GraphError> {
        let heads = self.heads();
        match heads.as_slice() {
            [single] => Ok(single),
            _ => Err(GraphError::MultipleHeads {
                heads: heads.iter().map(|revision| revision.id.clone()).collect(),
            }),
        }
    }

    /// `id` followed by its predecessors back to the root.
    ///
    /// # Errors
    /// Returns [`GraphError::UnknownRevision`] for ids outside the graph.
    pub fn ancestry(&self, id: &RevisionId) -> Result<Vec<&Revision>, GraphError> {
        let chain = self.ancestry_indices(self.position(id)?)?;
        Ok(chain
            .into_iter()
            .map(|position| &self.nodes[position])
            .collect())
    }

    /// Revisions ordered root-first by depth; ties keep declaration order.
    #[must_use]
    pub fn ordered(&self) -> Vec<&Revision> {
        let mut depths: Vec<(usize, usize)> = self
            .depths
            .iter()
            .enumerate()
            .map(|(position, depth)| (*depth, position))
            .collect();
        depths.sort_unstable();
        depths
            .into_iter()
            .map(|(_, position)| &self.nodes[position])
            .collect()
    }

    /// Computes the walk from the applied head `from` (None = base) to `target`.
    ///
    /// Forward walks list revisions oldest first with [`Direction::Up`]; backward walks list
    /// them newest first with [`Direction::Down`] and stop before the target revision.
    ///
    /// # Errors
    /// - [`GraphError::UnknownRevision`] when either end is not in the graph.
    /// - [`GraphError::MultipleHeads`] when the target is `Head` and the graph has diverged.
    /// - [`GraphError::Divergent`] when neither end is an ancestor of the other.
    /// - [`GraphError::Irreversible`] when a backward walk crosses an irreversible revision.
    pub fn resolve_path(
        &self,
        from: Option<&RevisionId>,
        target: &MigrationTarget,
    ) -> Result<MigrationPath<'_>, GraphError> {
        let from_position = from.map(|id| self.position(id)).transpose()?;
        let target_position = match target {
            MigrationTarget::Head => Some(self.position(&self.head()?.id)?),
            MigrationTarget::Revision(id) => Some(self.position(id)?),
            MigrationTarget::Base => None,
        };

        let target_chain = target_position
            .map(|position| self.ancestry_indices(position))
            .transpose()?
            .unwrap_or_default();
        let from_chain = from_position
            .map(|position| self.ancestry_indices(position))
            .transpose()?
            .unwrap_or_default();

        let forward = target_position.is_some()
            && from_position.map_or(true, |position| target_chain.contains(&position));
        if forward {
            let mut positions: Vec<usize> = target_chain
                .into_iter()
                .take_while(|position| Some(*position) != from_position)
                .collect();
            positions.reverse();
            return Ok(MigrationPath {
                steps: positions
                    .into_iter()
                    .map(|position| PathStep {
                        revision: &self.nodes[position],
                        direction: Direction::Up,
                    })
                    .collect(),
            });
        }

        let backward = from_position.is_some()
            && target_position.map_or(true, |position| from_chain.contains(&position));
        if backward {
            let mut steps = Vec::new();
            for position in from_chain
                .into_iter()
                .take_while(|position| Some(*position) != target_position)
            {
                let revision = &self.nodes[position];
                if revision.is_irreversible() {
                    return Err(GraphError::Irreversible {
                        revision: revision.id.clone(),
                    });
                }
                steps.push(PathStep {
                    revision,
                    direction: Direction::Down,
                });
            }
            return Ok(MigrationPath { steps });
        }

        if from_position.is_none() && target_position.is_none() {
            return Ok(MigrationPath::default());
        }

        Err(GraphError::Divergent {
            from: from.cloned(),
            to: target_position.map(|position| self.nodes[position].id.clone()),
        })
    }

    /// Static review of the revision chain, in the spirit of a pre-merge safety check.
    #[must_use]
    pub fn audit(&self) -> Vec<AuditFinding> {
        let mut findings = Vec::new();
        for revision in self.ordered() {
            let existing = self.tables_before(revision);
            let is_root = revision.predecessor.is_none();
            let mut finding = |severity, message: String| {
                findings.push(AuditFinding {
                    revision: revision.id.clone(),
                    severity,
                    message,
                });
            };

            if revision.upgrade_steps.is_empty() && !is_root {
                finding(
                    AuditSeverity::Warning,
                    "upgrade declares no steps".to_string(),
                );
            }
            if revision.downgrade_steps.is_empty() && !revision.is_irreversible() {
                finding(
                    AuditSeverity::Error,
                    "downgrade declares no steps; add a reverse or mark the revision irreversible"
                        .to_string(),
                );
            }

            for step in &revision.upgrade_steps {
                match step {
                    Step::CreateTable { schema } if existing.contains(&schema.name) => finding(
                        AuditSeverity::Error,
                        format!("creates table {} which already exists", schema.name),
                    ),
                    Step::CreateTable { schema } if !is_root => finding(
                        AuditSeverity::Warning,
                        format!(
                            "creates table {} outside the baseline revision; confirm it is not already provisioned",
                            schema.name
                        ),
                    ),
                    Step::DropTable { table, .. }
                        if revision.reversibility == crate::Reversibility::Exact =>
                    {
                        finding(
                            AuditSeverity::Warning,
                            format!(
                                "drops table {table} but claims an exact downgrade; dropped rows cannot be restored"
                            ),
                        );
                    }
                    Step::DropTable { table, .. } if !existing.contains(table) => finding(
                        AuditSeverity::Error,
                        format!("drops table {table} which no earlier revision creates"),
                    ),
                    _ => {}
                }
            }
        }
        findings
    }

    /// Tables created and not dropped by the ancestors of `revision`.
    fn tables_before(&self, revision: &Revision) -> BTreeSet<String> {
        let mut tables = BTreeSet::new();
        let Some(position) = self.index.get(&revision.id) else {
            return tables;
        };
        let Ok(mut chain) = self.ancestry_indices(*position) else {
            return tables;
        };
        chain.reverse();
        chain.pop();
        for ancestor in chain {
            for step in &self.nodes[ancestor].upgrade_steps {
                match step {
                    Step::CreateTable { schema } => {
                        tables.insert(schema.name.clone());
                    }
                    Step::DropTable { table, .. } => {
                        tables.remove(table);
                    }
                    _ => {}
                }
            }
        }
        tables
    }
}

/// Depth of every node, memoised so each parent edge is followed once. A walk that
/// revisits a node before reaching a known depth has found a cycle.
fn node_depths(nodes: &[Revision], parents: &[Option<usize>]) -> Result<Vec<usize>, GraphError> {
    let mut depths: Vec<Option<usize>> = vec![None; parents.len()];
    for start in 0..parents.len() {
        let mut pending = Vec::new();
        let mut on_walk = BTreeSet::new();
        let mut base = 0;
        let mut cursor = Some(start);
        while let Some(position) = cursor {
            if let Some(depth) = depths[position] {
                base = depth;
                break;
            }
            if !on_walk.insert(position) {
                return Err(GraphError::Cycle {
                    revision: nodes[start].id.clone(),
                });
            }
            pending.push(position);
            cursor = parents[position];
        }
        for position in pending.into_iter().rev() {
            base += 1;
            depths[position] = Some(base);
        }
    }
    Ok(depths.into_iter().map(Option::unwrap_or_default).collect())
}
