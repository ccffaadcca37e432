use scorch_core::{ComponentStatus, ComponentUpdate, Loop, Stage};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use utoipa::ToSchema;

/// Edge drawn from static metadata before the transition is known.
pub const PROVISIONAL: u8 = 0;
/// Edge whose transition actually happened.
pub const CONFIRMED: u8 = 2;

pub const LOOP_NODE: &str = "loop";
pub const DONE_NODE: &str = "done";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    /// Waiting on a human at a breakpoint
    Unstable,
    Background,
    Success,
    Failure,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeStatus::Success | NodeStatus::Failure)
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            NodeStatus::Running | NodeStatus::Unstable | NodeStatus::Background
        )
    }

    /// Map a component status onto a graph status. Only a `break` component
    /// reporting `running` itself is elevated to `unstable`.
    pub fn from_update(status: ComponentStatus, component_type: &str) -> Self {
        match status {
            ComponentStatus::Start => NodeStatus::Running,
            ComponentStatus::Running if component_type == "break" => NodeStatus::Unstable,
            ComponentStatus::Running => NodeStatus::Running,
            ComponentStatus::Background => NodeStatus::Background,
            ComponentStatus::Success => NodeStatus::Success,
            ComponentStatus::Failure => NodeStatus::Failure,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Stage,
    Loop,
    Done,
    Component,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct Edge {
    pub target: usize,
    pub weight: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct Node {
    /// `configure`, `loop`, `done`, or `<stage>/<component>`
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    pub status: NodeStatus,
    pub edges: Vec<Edge>,
}

/// Live graph of one (experiment, run, loop) slot.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct Pipeline {
    pub experiment: String,
    pub run: usize,
    #[serde(rename = "loop")]
    pub loop_index: usize,
    /// Current iteration of this loop level
    pub count: usize,
    pub nodes: Vec<Node>,
    #[serde(skip)]
    #[cfg_attr(feature = "typescript", ts(skip))]
    index: HashMap<String, usize>,
    #[serde(skip)]
    #[cfg_attr(feature = "typescript", ts(skip))]
    children: HashMap<Stage, Vec<usize>>,
}

fn component_id(stage: Stage, name: &str) -> String {
    format!("{}/{}", stage, name)
}

impl Pipeline {
    pub fn build(experiment: &str, run: usize, loop_index: usize, spec: &Loop) -> Self {
        let mut pipeline = Pipeline {
            experiment: experiment.to_string(),
            run,
            loop_index,
            count: 1,
            nodes: Vec::new(),
            index: HashMap::new(),
            children: HashMap::new(),
        };

        for stage in Stage::ALL {
            pipeline.add_node(stage.as_str().to_string(), stage.as_str(), NodeKind::Stage, Some(stage));
        }
        if spec.nested.is_some() {
            pipeline.add_node(LOOP_NODE.to_string(), LOOP_NODE, NodeKind::Loop, None);
        }
        pipeline.add_node(DONE_NODE.to_string(), DONE_NODE, NodeKind::Done, None);

        for stage in Stage::ALL {
            let mut children = Vec::new();
            for name in spec.stage(stage) {
                let idx = pipeline.add_node(component_id(stage, name), name, NodeKind::Component, Some(stage));
                if !children.contains(&idx) {
                    children.push(idx);
                }
            }
            pipeline.children.insert(stage, children);
        }

        for stage in Stage::ALL {
            let anchor = pipeline.anchor(stage);
            let next = pipeline.next(stage);
            let children = pipeline.children_of(stage);
            if children.is_empty() {
                pipeline.connect(anchor, next);
            }
            for child in children {
                pipeline.connect(anchor, child);
                pipeline.connect(child, next);
            }
        }

        // compensation paths
        let (configure, cleanup) = (pipeline.anchor(Stage::Configure), pipeline.anchor(Stage::Cleanup));
        pipeline.connect(configure, cleanup);
        let (start, stop) = (pipeline.anchor(Stage::Start), pipeline.anchor(Stage::Stop));
        pipeline.connect(start, stop);

        if let Some(lp) = pipeline.node_index(LOOP_NODE) {
            pipeline.connect(lp, stop);
        }

        pipeline
    }

    fn add_node(&mut self, id: String, name: &str, kind: NodeKind, stage: Option<Stage>) -> usize {
        if let Some(idx) = self.index.get(&id) {
            return *idx;
        }
        let idx = self.nodes.len();
        self.index.insert(id.clone(), idx);
        self.nodes.push(Node {
            id,
            name: name.to_string(),
            kind,
            stage,
            status: NodeStatus::Pending,
            edges: Vec::new(),
        });
        idx
    }

    fn connect(&mut self, from: usize, to: usize) {
        let edges = &mut self.nodes[from].edges;
        if !edges.iter().any(|e| e.target == to) {
            edges.push(Edge {
                target: to,
                weight: PROVISIONAL,
            });
        }
    }

    fn confirm(&mut self, from: usize, to: usize) {
        if let Some(edge) = self.nodes[from].edges.iter_mut().find(|e| e.target == to) {
            edge.weight = CONFIRMED;
        }
    }

    pub fn node_index(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.node_index(id).map(|idx| &self.nodes[idx])
    }

    pub fn has_loop(&self) -> bool {
        self.index.contains_key(LOOP_NODE)
    }

    // Stage anchors are always the first four nodes, in Stage::ALL order.
    fn anchor(&self, stage: Stage) -> usize {
        match stage {
            Stage::Configure => 0,
            Stage::Start => 1,
            Stage::Stop => 2,
            Stage::Cleanup => 3,
        }
    }

    fn done(&self) -> usize {
        self.index[DONE_NODE]
    }

    fn next(&self, stage: Stage) -> usize {
        match stage {
            Stage::Configure => self.anchor(Stage::Start),
            Stage::Start => self
                .node_index(LOOP_NODE)
                .unwrap_or_else(|| self.anchor(Stage::Stop)),
            Stage::Stop => self.anchor(Stage::Cleanup),
            Stage::Cleanup => self.done(),
        }
    }

    fn compensation(&self, stage: Stage) -> Option<usize> {
        match stage {
            Stage::Configure => Some(self.anchor(Stage::Cleanup)),
            Stage::Start => Some(self.anchor(Stage::Stop)),
            Stage::Stop | Stage::Cleanup => None,
        }
    }

    fn children_of(&self, stage: Stage) -> Vec<usize> {
        self.children.get(&stage).cloned().unwrap_or_default()
    }

    /// Apply a component status event. Returns whether anything changed.
    pub fn apply(&mut self, update: &ComponentUpdate) -> bool {
        let Some(idx) = self.node_index(&component_id(update.stage, &update.name)) else {
            return false;
        };

        let status = NodeStatus::from_update(update.status, &update.component_type);
        let mut changed = self.count != update.count;
        self.count = update.count;

        if self.nodes[idx].status != status {
            self.nodes[idx].status = status;
            changed = true;
        }

        if matches!(update.status, ComponentStatus::Start | ComponentStatus::Running) {
            let anchor = self.anchor(update.stage);
            self.confirm(anchor, idx);
        }

        self.settle(update.stage) || changed
    }

    /// Recompute a stage anchor from its component nodes. Terminal anchors
    /// never change.
    fn settle(&mut self, stage: Stage) -> bool {
        let anchor = self.anchor(stage);
        let current = self.nodes[anchor].status;
        if current.is_terminal() {
            return false;
        }

        let children = self.children_of(stage);
        let statuses: Vec<NodeStatus> = children.iter().map(|c| self.nodes[*c].status).collect();
        let next = self.next(stage);
        let any_failed = statuses.contains(&NodeStatus::Failure);
        let any_active = statuses.iter().any(|s| s.is_active());

        let new_status = if stage.is_teardown() {
            let all_settled = statuses
                .iter()
                .all(|s| s.is_terminal() || *s == NodeStatus::Background);
            if !children.is_empty() && all_settled {
                for child in &children {
                    self.confirm(*child, next);
                }
                if any_failed {
                    NodeStatus::Failure
                } else {
                    NodeStatus::Success
                }
            } else if any_active || statuses.iter().any(|s| s.is_terminal()) {
                NodeStatus::Running
            } else {
                current
            }
        } else if any_failed {
            if let Some(target) = self.compensation(stage) {
                self.confirm(anchor, target);
            }
            NodeStatus::Failure
        } else if !children.is_empty()
            && statuses
                .iter()
                .all(|s| matches!(s, NodeStatus::Success | NodeStatus::Background))
        {
            for child in &children {
                self.confirm(*child, next);
            }
            NodeStatus::Success
        } else if any_active {
            NodeStatus::Running
        } else {
            current
        };

        self.nodes[anchor].status = new_status;
        new_status != current
    }

    /// Close out a stage once the engine has finished it. Covers stages with
    /// no components and stages cut short before every component reported.
    pub fn complete_stage(&mut self, stage: Stage, success: bool) -> bool {
        let settled = self.settle(stage);
        let anchor = self.anchor(stage);
        if self.nodes[anchor].status.is_terminal() {
            return settled;
        }

        let next = self.next(stage);
        let children = self.children_of(stage);
        if success {
            if children.is_empty() {
                self.confirm(anchor, next);
            }
            for child in children {
                self.confirm(child, next);
            }
            self.nodes[anchor].status = NodeStatus::Success;
        } else {
            match self.compensation(stage) {
                Some(target) => self.confirm(anchor, target),
                None if children.is_empty() => self.confirm(anchor, next),
                None => {
                    for child in children {
                        self.confirm(child, next);
                    }
                }
            }
            self.nodes[anchor].status = NodeStatus::Failure;
        }
        true
    }

    /// Set the aggregate nested-loop anchor.
    pub fn set_loop_status(&mut self, status: NodeStatus) -> bool {
        let Some(idx) = self.node_index(LOOP_NODE) else {
            return false;
        };
        let current = self.nodes[idx].status;
        if current.is_terminal() || current == status {
            return false;
        }
        self.nodes[idx].status = status;
        if status.is_terminal() {
            let stop = self.anchor(Stage::Stop);
            self.confirm(idx, stop);
        }
        true
    }

    /// Drop a breakpoint marker from the loop anchor, if one is set.
    pub fn clear_unstable_loop(&mut self) -> bool {
        match self.node_index(LOOP_NODE) {
            Some(idx) if self.nodes[idx].status == NodeStatus::Unstable => {
                self.nodes[idx].status = NodeStatus::Running;
                true
            }
            _ => false,
        }
    }

    pub fn finish(&mut self, success: bool) -> bool {
        let done = self.done();
        let status = if success {
            NodeStatus::Success
        } else {
            NodeStatus::Failure
        };
        if self.nodes[done].status == status {
            return false;
        }
        self.nodes[done].status = status;
        true
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn to_value(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(with_loop: bool) -> Loop {
        let mut spec = Loop {
            configure: vec!["A".to_string()],
            start: vec!["A".to_string(), "B".to_string()],
            stop: vec!["A".to_string()],
            cleanup: vec!["A".to_string()],
            ..Default::default()
        };
        if with_loop {
            spec.nested = Some(Box::new(Loop {
                start: vec!["C".to_string()],
                count: 2,
                ..Default::default()
            }));
        }
        spec
    }

    fn update(stage: Stage, name: &str, status: ComponentStatus) -> ComponentUpdate {
        ComponentUpdate {
            experiment: "exp".to_string(),
            name: name.to_string(),
            component_type: name.to_lowercase(),
            run: 0,
            loop_index: 0,
            count: 1,
            stage,
            status,
            output: None,
        }
    }

    fn weight(p: &Pipeline, from: &str, to: &str) -> u8 {
        let from = p.node(from).unwrap();
        let to = p.node_index(to).unwrap();
        from.edges.iter().find(|e| e.target == to).unwrap().weight
    }

    fn succeed(p: &mut Pipeline, stage: Stage, name: &str) {
        p.apply(&update(stage, name, ComponentStatus::Start));
        p.apply(&update(stage, name, ComponentStatus::Success));
    }

    #[test]
    fn test_build_layout() {
        let p = Pipeline::build("exp", 0, 0, &spec(true));
        assert!(p.has_loop());
        assert_eq!(p.nodes[0].id, "configure");
        assert_eq!(p.nodes[3].id, "cleanup");
        assert!(p.node("start/B").is_some());
        assert!(p.nodes.iter().all(|n| n.status == NodeStatus::Pending));
        assert_eq!(weight(&p, "start/B", "loop"), PROVISIONAL);
        assert_eq!(weight(&p, "loop", "stop"), PROVISIONAL);
        assert_eq!(weight(&p, "configure", "cleanup"), PROVISIONAL);
        assert_eq!(weight(&p, "start", "stop"), PROVISIONAL);
    }

    #[test]
    fn test_empty_stage_links_anchors() {
        let p = Pipeline::build("exp", 0, 1, &Loop::default());
        assert!(!p.has_loop());
        assert_eq!(weight(&p, "configure", "start"), PROVISIONAL);
        assert_eq!(weight(&p, "cleanup", "done"), PROVISIONAL);
    }

    #[test]
    fn test_stage_success_requires_all_components() {
        let mut p = Pipeline::build("exp", 0, 0, &spec(false));
        succeed(&mut p, Stage::Start, "A");
        assert_eq!(p.node("start").unwrap().status, NodeStatus::Running);
        assert_eq!(weight(&p, "start/A", "stop"), PROVISIONAL);

        p.apply(&update(Stage::Start, "B", ComponentStatus::Start));
        p.apply(&update(Stage::Start, "B", ComponentStatus::Background));
        assert_eq!(p.node("start").unwrap().status, NodeStatus::Success);
        assert_eq!(weight(&p, "start/A", "stop"), CONFIRMED);
        assert_eq!(weight(&p, "start/B", "stop"), CONFIRMED);
        assert_eq!(weight(&p, "start", "start/B"), CONFIRMED);
    }

    #[test]
    fn test_configure_failure_confirms_cleanup_edge() {
        let mut p = Pipeline::build("exp", 0, 0, &spec(false));
        p.apply(&update(Stage::Configure, "A", ComponentStatus::Start));
        assert!(p.apply(&update(Stage::Configure, "A", ComponentStatus::Failure)));

        assert_eq!(p.node("configure").unwrap().status, NodeStatus::Failure);
        assert_eq!(weight(&p, "configure", "cleanup"), CONFIRMED);
        assert_eq!(weight(&p, "configure/A", "start"), PROVISIONAL);
    }

    #[test]
    fn test_teardown_waits_for_every_child() {
        let spec = Loop {
            stop: vec!["A".to_string(), "B".to_string()],
            ..Default::default()
        };
        let mut p = Pipeline::build("exp", 0, 0, &spec);
        p.apply(&update(Stage::Stop, "A", ComponentStatus::Start));
        p.apply(&update(Stage::Stop, "A", ComponentStatus::Failure));
        assert_eq!(p.node("stop").unwrap().status, NodeStatus::Running);

        succeed(&mut p, Stage::Stop, "B");
        assert_eq!(p.node("stop").unwrap().status, NodeStatus::Failure);
        assert_eq!(weight(&p, "stop/A", "cleanup"), CONFIRMED);
    }

    #[test]
    fn test_break_running_is_unstable() {
        let mut p = Pipeline::build("exp", 0, 0, &spec(false));
        let mut u = update(Stage::Start, "A", ComponentStatus::Running);
        u.component_type = "break".to_string();
        p.apply(&u);
        assert_eq!(p.node("start/A").unwrap().status, NodeStatus::Unstable);
        assert_eq!(p.node("start").unwrap().status, NodeStatus::Running);

        u.component_type = "pause".to_string();
        p.apply(&u);
        assert_eq!(p.node("start/A").unwrap().status, NodeStatus::Running);
    }

    #[test]
    fn test_terminal_anchor_is_sticky() {
        let mut p = Pipeline::build("exp", 0, 0, &spec(false));
        p.apply(&update(Stage::Configure, "A", ComponentStatus::Failure));
        p.apply(&update(Stage::Configure, "A", ComponentStatus::Success));
        assert_eq!(p.node("configure").unwrap().status, NodeStatus::Failure);
        assert!(!p.complete_stage(Stage::Configure, true));
    }

    #[test]
    fn test_loop_anchor() {
        let mut p = Pipeline::build("exp", 0, 0, &spec(true));
        assert!(p.set_loop_status(NodeStatus::Unstable));
        assert!(p.clear_unstable_loop());
        assert_eq!(p.node("loop").unwrap().status, NodeStatus::Running);
        assert!(p.set_loop_status(NodeStatus::Success));
        assert_eq!(weight(&p, "loop", "stop"), CONFIRMED);
        assert!(!p.set_loop_status(NodeStatus::Running));
    }

    #[test]
    fn test_unknown_component_is_ignored() {
        let mut p = Pipeline::build("exp", 0, 0, &spec(false));
        assert!(!p.apply(&update(Stage::Start, "Z", ComponentStatus::Start)));
    }

    #[test]
    fn test_full_success_path() {
        let mut p = Pipeline::build("exp", 0, 0, &spec(true));
        succeed(&mut p, Stage::Configure, "A");
        succeed(&mut p, Stage::Start, "A");
        succeed(&mut p, Stage::Start, "B");
        p.set_loop_status(NodeStatus::Running);
        p.set_loop_status(NodeStatus::Success);
        succeed(&mut p, Stage::Stop, "A");
        succeed(&mut p, Stage::Cleanup, "A");
        p.finish(true);

        assert_eq!(p.node("done").unwrap().status, NodeStatus::Success);
        for (from, to) in [
            ("configure", "configure/A"),
            ("configure/A", "start"),
            ("start/B", "loop"),
            ("loop", "stop"),
            ("stop/A", "cleanup"),
            ("cleanup/A", "done"),
        ] {
            assert_eq!(weight(&p, from, to), CONFIRMED, "{} -> {}", from, to);
        }
        // compensation paths were never taken
        assert_eq!(weight(&p, "configure", "cleanup"), PROVISIONAL);
        assert_eq!(weight(&p, "start", "stop"), PROVISIONAL);
    }

    #[test]
    fn test_serialization_is_stable() {
        let p = Pipeline::build("exp", 0, 0, &spec(true));
        assert_eq!(p.to_json().unwrap(), p.clone().to_json().unwrap());
        let value = p.to_value().unwrap();
        assert_eq!(value["loop"], 0);
        assert_eq!(value["nodes"][4]["type"], "loop");
        assert!(value.get("index").is_none());
    }
}
