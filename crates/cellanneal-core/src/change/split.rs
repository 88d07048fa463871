use super::{Proposal, check_constraints, match_by_name};
use crate::cell::Cell;
use crate::config::AnnealConfig;
use crate::lineage::{Lineage, LineageError, NodeId};
use rand::Rng;
use std::f64::consts::PI;

/// Probability of attempting a split for a cell of the given size.
///
/// Zero up to `gate`, then rising along a slow sine capped at one.
#[must_use]
pub fn split_probability(size: f64, gate: f64) -> f64 {
    if size <= gate {
        return 0.0;
    }
    ((size - gate) / (2.0 * PI * PI)).sin().clamp(0.0, 1.0)
}

// Grandchildren must be named after the cells they will hang from, once each.
// A lone copy of the split cell has no daughter to hang from and is rejected.
fn grandchildren_fit(lineage: &Lineage, grandchildren: &[NodeId], names: &[&str]) -> bool {
    let mut claimed = Vec::with_capacity(grandchildren.len());
    for id in grandchildren {
        let Some(cell) = lineage.cell(*id) else {
            return false;
        };
        let name = cell.name();
        if !names.contains(&name) || claimed.contains(&name) {
            return false;
        }
        claimed.push(name);
    }
    true
}

/// Moves a division one frame earlier: a parent's single child becomes two daughters.
#[derive(Debug, Clone)]
pub struct Split {
    parent: NodeId,
    child: NodeId,
    frame: usize,
    first: Cell,
    second: Cell,
}

impl Split {
    /// Splits the child of `node`'s parent at a random ratio.
    pub fn propose<R: Rng + ?Sized>(
        lineage: &Lineage,
        node: NodeId,
        config: &AnnealConfig,
        rng: &mut R,
    ) -> Option<Self> {
        let parent = lineage.node(node)?.parent()?;
        let &[child] = lineage.node(parent)?.children() else {
            return None;
        };
        let child_node = lineage.node(child)?;
        if child_node.is_dormant() {
            return None;
        }
        let schedule = &config.schedule;
        if let Some(gate) = schedule.split_gate_length
            && rng.random::<f64>() >= split_probability(child_node.cell().size(), gate)
        {
            return None;
        }
        let alpha = rng.random_range(schedule.split_alpha_min..=schedule.split_alpha_max);
        Self::with_alpha(lineage, parent, alpha)
    }

    /// Splits the single child of `parent` at ratio `alpha`.
    #[must_use]
    pub fn with_alpha(lineage: &Lineage, parent: NodeId, alpha: f64) -> Option<Self> {
        let &[child] = lineage.node(parent)?.children() else {
            return None;
        };
        let child_node = lineage.node(child)?;
        let (first, second) = child_node.cell().split(alpha).ok()?;
        Some(Self {
            parent,
            child,
            frame: child_node.frame(),
            first,
            second,
        })
    }

    #[must_use]
    pub fn daughters(&self) -> (&Cell, &Cell) {
        (&self.first, &self.second)
    }

    fn transitions(&self, lineage: &Lineage) -> Option<Vec<(Cell, Cell)>> {
        let parent = lineage.cell(self.parent)?;
        let alpha = self.first.split_alpha()?;
        let (a, b) = parent.split(alpha).ok()?;
        let mut pairs = Vec::new();
        match_by_name(&[a, b], &[&self.first, &self.second], &mut pairs);
        let grandchildren: Vec<&Cell> = lineage
            .grandchildren(self.parent)
            .iter()
            .filter_map(|id| lineage.cell(*id))
            .collect();
        match_by_name(
            &[self.first.clone(), self.second.clone()],
            &grandchildren,
            &mut pairs,
        );
        Some(pairs)
    }
}

impl Proposal for Split {
    fn is_valid(&self, lineage: &Lineage, config: &AnnealConfig) -> bool {
        let Some(parent) = lineage.node(self.parent) else {
            return false;
        };
        if parent.children() != [self.child] {
            return false;
        }
        let Some(child) = lineage.node(self.child) else {
            return false;
        };
        if child.is_dormant() {
            return false;
        }
        let Some(images) = lineage.images(self.frame) else {
            return false;
        };
        let names = [self.first.name(), self.second.name()];
        if !grandchildren_fit(lineage, child.children(), &names) {
            return false;
        }
        let Some(pairs) = self.transitions(lineage) else {
            return false;
        };
        check_constraints(
            &[&self.first, &self.second],
            &pairs,
            images.width(),
            images.height(),
            config,
        )
    }

    fn cost_diff(&self, lineage: &Lineage, config: &AnnealConfig) -> f64 {
        let Some(child) = lineage.cell(self.child) else {
            return f64::INFINITY;
        };
        lineage.redraw_delta(self.frame, &[child], &[&self.first, &self.second])
            + self.penalty(config)
    }

    fn penalty(&self, config: &AnnealConfig) -> f64 {
        config.split_cost
    }

    fn apply(self, lineage: &mut Lineage) -> Result<(), LineageError> {
        let child = lineage
            .cell(self.child)
            .cloned()
            .ok_or(LineageError::MissingNode)?;
        lineage.commit_redraw(self.frame, &[&child], &[&self.first, &self.second])?;
        lineage.replace_children(self.parent, self.frame, vec![self.first, self.second])?;
        Ok(())
    }
}

/// Moves a division one frame later: a parent's two daughters merge back into one child.
#[derive(Debug, Clone)]
pub struct Combination {
    parent: NodeId,
    children: [NodeId; 2],
    frame: usize,
    combined: Cell,
}

impl Combination {
    /// Merges the two children of `node`'s parent.
    #[must_use]
    pub fn propose(lineage: &Lineage, node: NodeId) -> Option<Self> {
        let parent = lineage.node(node)?.parent()?;
        Self::for_parent(lineage, parent)
    }

    /// Merges the two children of `parent`.
    #[must_use]
    pub fn for_parent(lineage: &Lineage, parent: NodeId) -> Option<Self> {
        let &[a, b] = lineage.node(parent)?.children() else {
            return None;
        };
        let (first, second) = (lineage.node(a)?, lineage.node(b)?);
        let (children, combined) = if first.cell().name() <= second.cell().name() {
            ([a, b], first.cell().combine(second.cell()).ok()?)
        } else {
            ([b, a], second.cell().combine(first.cell()).ok()?)
        };
        Some(Self {
            parent,
            children,
            frame: first.frame(),
            combined,
        })
    }

    #[must_use]
    pub const fn combined(&self) -> &Cell {
        &self.combined
    }

    fn transitions(&self, lineage: &Lineage) -> Option<Vec<(Cell, Cell)>> {
        let parent = lineage.cell(self.parent)?;
        let mut pairs = vec![(parent.clone(), self.combined.clone())];
        let grandchildren: Vec<&Cell> = lineage
            .grandchildren(self.parent)
            .iter()
            .filter_map(|id| lineage.cell(*id))
            .collect();
        match grandchildren.as_slice() {
            [] => {}
            [only] if only.name() == self.combined.name() => {
                pairs.push((self.combined.clone(), (*only).clone()));
            }
            _ => {
                if let Some(alpha) = grandchildren.iter().find_map(|cell| cell.split_alpha()) {
                    let (a, b) = self.combined.split(alpha).ok()?;
                    match_by_name(&[a, b], &grandchildren, &mut pairs);
                }
            }
        }
        Some(pairs)
    }
}

impl Proposal for Combination {
    fn is_valid(&self, lineage: &Lineage, config: &AnnealConfig) -> bool {
        let Some(parent) = lineage.node(self.parent) else {
            return false;
        };
        let [a, b] = self.children;
        if parent.children() != [a, b] && parent.children() != [b, a] {
            return false;
        }
        if self
            .children
            .iter()
            .any(|id| lineage.node(*id).is_none_or(|node| node.is_dormant()))
        {
            return false;
        }
        let Some(images) = lineage.images(self.frame) else {
            return false;
        };
        let grandchildren = lineage.grandchildren(self.parent);
        let left = format!("{}0", self.combined.name());
        let right = format!("{}1", self.combined.name());
        let fits = match grandchildren.as_slice() {
            [only] => grandchildren_fit(
                lineage,
                &[*only],
                &[self.combined.name(), left.as_str(), right.as_str()],
            ),
            many => {
                many.len() <= 2
                    && grandchildren_fit(lineage, many, &[left.as_str(), right.as_str()])
            }
        };
        if !fits {
            return false;
        }
        let Some(pairs) = self.transitions(lineage) else {
            return false;
        };
        check_constraints(
            &[&self.combined],
            &pairs,
            images.width(),
            images.height(),
            config,
        )
    }

    fn cost_diff(&self, lineage: &Lineage, config: &AnnealConfig) -> f64 {
        let [a, b] = self.children;
        let (Some(first), Some(second)) = (lineage.cell(a), lineage.cell(b)) else {
            return f64::INFINITY;
        };
        lineage.redraw_delta(self.frame, &[first, second], &[&self.combined])
            + self.penalty(config)
    }

    fn penalty(&self, config: &AnnealConfig) -> f64 {
        config.combine_cost
    }

    fn apply(self, lineage: &mut Lineage) -> Result<(), LineageError> {
        let [a, b] = self.children;
        let first = lineage.cell(a).cloned().ok_or(LineageError::MissingNode)?;
        let second = lineage.cell(b).cloned().ok_or(LineageError::MissingNode)?;
        lineage.commit_redraw(self.frame, &[&first, &second], &[&self.combined])?;
        lineage.replace_children(self.parent, self.frame, vec![self.combined])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::Bacilli;
    use crate::image::Image;
    use crate::render::RenderParams;

    fn blank() -> Image<f64> {
        Image::new(40, 24, 0.0).expect("image")
    }

    // Frame 0 holds "a"; frame 1 holds its copy.
    fn persisted() -> (Lineage, NodeId) {
        let mut lineage = Lineage::new(&AnnealConfig::default());
        lineage.forward(blank(), RenderParams::default()).expect("frame");
        let root = lineage
            .add_cell(0, Bacilli::new("a", 20.0, 12.0, 4.0, 16.0, 0.0).into())
            .expect("cell");
        lineage.render_frame(0).expect("render");
        lineage.copy_forward(blank()).expect("copy");
        (lineage, root)
    }

    #[test]
    fn split_probability_is_gated() {
        assert_eq!(split_probability(10.0, 14.0), 0.0);
        assert_eq!(split_probability(14.0, 14.0), 0.0);
        let p = split_probability(20.0, 14.0);
        assert!(p > 0.0 && p < 1.0);
        assert_eq!(split_probability(14.0 + PI * PI * PI, 14.0), 1.0);
    }

    #[test]
    fn split_then_combine_restores_lineage() {
        let (mut lineage, root) = persisted();
        let config = AnnealConfig::default();
        let before = lineage.frame_cost(1).expect("cost");

        let split = Split::with_alpha(&lineage, root, 0.5).expect("split");
        assert!(split.is_valid(&lineage, &config));
        let delta = split.cost_diff(&lineage, &config);
        split.apply(&mut lineage).expect("apply");
        let children = lineage.node(root).expect("node").children().to_vec();
        assert_eq!(children.len(), 2);
        let names: Vec<&str> = children
            .iter()
            .map(|id| lineage.cell(*id).expect("cell").name())
            .collect();
        assert_eq!(names, ["a0", "a1"]);
        let after = lineage.frame_cost(1).expect("cost");
        assert!((after - before - delta).abs() < 1e-9);
        assert_eq!(lineage.frame(1).expect("frame").len(), 2);

        let combination = Combination::for_parent(&lineage, root).expect("combination");
        assert!(combination.is_valid(&lineage, &config));
        let delta = combination.cost_diff(&lineage, &config);
        combination.apply(&mut lineage).expect("apply");
        let children = lineage.node(root).expect("node").children().to_vec();
        assert_eq!(children.len(), 1);
        let merged = lineage.node(children[0]).expect("node");
        assert_eq!(merged.cell().name(), "a");
        assert!(merged.children().is_empty());
        let final_cost = lineage.frame_cost(1).expect("cost");
        assert!((final_cost - after - delta).abs() < 1e-9);
        assert_eq!(lineage.frame(1).expect("frame").len(), 1);
    }

    #[test]
    fn combination_of_two_children_without_grandchildren_is_valid() {
        let mut lineage = Lineage::new(&AnnealConfig::default());
        lineage.forward(blank(), RenderParams::default()).expect("frame");
        let parent_cell: Cell = Bacilli::new("p", 20.0, 12.0, 4.0, 16.0, 0.3).into();
        let parent = lineage.add_cell(0, parent_cell.clone()).expect("cell");
        lineage.forward(blank(), RenderParams::default()).expect("frame");
        let (a, b) = parent_cell.split(0.4).expect("split");
        lineage.add_cell(1, a).expect("cell");
        lineage.add_cell(1, b).expect("cell");
        lineage.render_all().expect("render");

        let combination = Combination::for_parent(&lineage, parent).expect("combination");
        assert!(combination.is_valid(&lineage, &AnnealConfig::default()));
        combination.apply(&mut lineage).expect("apply");
        let [child] = lineage.node(parent).expect("node").children() else {
            panic!("expected a single child");
        };
        let child = lineage.node(*child).expect("node");
        assert_eq!(child.children().len(), 0);
        assert_eq!(child.cell().name(), "p");
        assert_eq!(lineage.frame(1).expect("frame").len(), 1);
    }

    #[test]
    fn split_reattaches_matching_grandchildren() {
        let (mut lineage, root) = persisted();
        let config = AnnealConfig::default();
        let copy = lineage.node(root).expect("node").children()[0];
        let copy_cell = lineage.cell(copy).expect("cell").clone();
        lineage.forward(blank(), RenderParams::default()).expect("frame");
        let (g0, g1) = copy_cell.split(0.5).expect("split");
        let g0 = lineage.add_cell(2, g0).expect("cell");
        let g1 = lineage.add_cell(2, g1).expect("cell");
        lineage.render_all().expect("render");

        let split = Split::with_alpha(&lineage, root, 0.5).expect("split");
        assert!(split.is_valid(&lineage, &config));
        split.apply(&mut lineage).expect("apply");
        for grandchild in [g0, g1] {
            let parent = lineage.node(grandchild).and_then(|n| n.parent()).expect("parent");
            let parent = lineage.node(parent).expect("node");
            assert_eq!(parent.frame(), 1);
            assert_eq!(parent.children(), &[grandchild]);
            assert_eq!(
                parent.cell().name(),
                lineage.cell(grandchild).expect("cell").name()
            );
        }
    }

    #[test]
    fn split_rejects_a_grandchild_named_after_the_child() {
        let (mut lineage, root) = persisted();
        let config = AnnealConfig::default();
        lineage.copy_forward(blank()).expect("copy");
        let copy = lineage.node(root).expect("node").children()[0];
        let [grandchild] = lineage.node(copy).expect("node").children() else {
            panic!("expected a single grandchild");
        };
        assert_eq!(lineage.cell(*grandchild).expect("cell").name(), "a");

        let split = Split::with_alpha(&lineage, root, 0.5).expect("split");
        assert!(!split.is_valid(&lineage, &config));
    }

    #[test]
    fn split_requires_a_single_child() {
        let (mut lineage, root) = persisted();
        Split::with_alpha(&lineage, root, 0.5)
            .expect("split")
            .apply(&mut lineage)
            .expect("apply");
        assert!(Split::with_alpha(&lineage, root, 0.5).is_none());
    }

    #[test]
    fn split_outside_motion_limits_is_rejected() {
        let (lineage, root) = persisted();
        let mut config = AnnealConfig::default();
        config.bacilli.min_length = 9.0;
        let split = Split::with_alpha(&lineage, root, 0.5).expect("split");
        assert!(!split.is_valid(&lineage, &config));
    }
}
