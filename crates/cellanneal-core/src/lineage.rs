//! Frame-by-frame cell forest and the image buffers kept in step with it.
//!
//! Nodes live in a generational arena. A node in frame `i` may only link to
//! a parent in frame `i - 1`; one child means the cell persisted, two mean it
//! split.

use crate::cell::Cell;
use crate::config::AnnealConfig;
use crate::cost::{CostInputs, Objective, ObjectiveKind};
use crate::distance::distance_weights;
use crate::geometry::Region;
use crate::image::{Coverage, Image, ImageError, Patch};
use crate::render::{DrawMode, RenderParams, render_cells, shade};
use rand::Rng;
use rayon::prelude::*;
use slotmap::{SlotMap, new_key_type};
use smallvec::SmallVec;
use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use thiserror::Error;
use tracing::{debug, warn};

new_key_type! {
    /// Stable handle for lineage nodes backed by a generational slot map.
    pub struct NodeId;
}

/// Number of superseded values a node keeps for `pop`.
pub const HISTORY_CAPACITY: usize = 4;

/// Errors raised while building or editing a lineage.
#[derive(Debug, Error)]
pub enum LineageError {
    #[error("frame {0} does not exist")]
    MissingFrame(usize),
    #[error("lineage node no longer exists")]
    MissingNode,
    #[error(transparent)]
    Image(#[from] ImageError),
}

/// One cell's value history and its links to neighbouring frames.
#[derive(Debug, Clone)]
pub struct CellNode {
    current: Cell,
    undo: SmallVec<[Cell; HISTORY_CAPACITY]>,
    parent: Option<NodeId>,
    children: SmallVec<[NodeId; 2]>,
    frame: usize,
    dormant: bool,
}

impl CellNode {
    fn new(cell: Cell, frame: usize, parent: Option<NodeId>) -> Self {
        Self {
            current: cell,
            undo: SmallVec::new(),
            parent,
            children: SmallVec::new(),
            frame,
            dormant: false,
        }
    }

    /// Current value.
    #[must_use]
    pub const fn cell(&self) -> &Cell {
        &self.current
    }

    #[must_use]
    pub const fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    #[must_use]
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    #[must_use]
    pub const fn frame(&self) -> usize {
        self.frame
    }

    #[must_use]
    pub const fn is_dormant(&self) -> bool {
        self.dormant
    }

    /// Number of values held, including the current one.
    #[must_use]
    pub fn history_len(&self) -> usize {
        self.undo.len() + 1
    }

    /// Makes `cell` current, keeping the previous value for `pop`.
    pub fn push(&mut self, cell: Cell) {
        let previous = std::mem::replace(&mut self.current, cell);
        if self.undo.len() == HISTORY_CAPACITY {
            self.undo.remove(0);
        }
        self.undo.push(previous);
    }

    /// Restores the previous value and returns the discarded one.
    pub fn pop(&mut self) -> Option<Cell> {
        let previous = self.undo.pop()?;
        Some(std::mem::replace(&mut self.current, previous))
    }

    /// Drops every superseded value.
    pub fn flatten(&mut self) {
        self.undo.clear();
    }
}

/// One time step: cells by name plus the render settings in effect.
#[derive(Debug, Clone)]
pub struct Frame {
    nodes: BTreeMap<String, NodeId>,
    render: RenderParams,
}

impl Frame {
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[must_use]
    pub fn node(&self, name: &str) -> Option<NodeId> {
        self.nodes.get(name).copied()
    }

    /// Node handles in name order.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.values().copied()
    }

    #[must_use]
    pub const fn render(&self) -> &RenderParams {
        &self.render
    }
}

/// Buffers belonging to one frame.
#[derive(Debug, Clone)]
pub struct FrameImages {
    pub real: Image<f64>,
    pub synth: Image<f64>,
    pub occupancy: Image<Coverage>,
    pub weights: Option<Image<f64>>,
}

impl FrameImages {
    #[must_use]
    pub fn inputs(&self) -> CostInputs<'_> {
        CostInputs {
            real: &self.real,
            weights: self.weights.as_ref(),
        }
    }

    #[must_use]
    pub const fn width(&self) -> usize {
        self.real.width()
    }

    #[must_use]
    pub const fn height(&self) -> usize {
        self.real.height()
    }
}

// Occupancy edits restricted to one frame, plus the re-shaded pixels.
struct Redraw {
    patch: Patch,
    target: Region,
    shaded: Vec<f64>,
}

/// Ordered frames, their cell forest, and per-frame image buffers.
#[derive(Debug, Clone)]
pub struct Lineage {
    nodes: SlotMap<NodeId, CellNode>,
    frames: Vec<Frame>,
    images: Vec<FrameImages>,
    objective: Objective,
    distance_divisor: f64,
    pixels_per_micron: f64,
}

impl Lineage {
    /// Empty lineage using the objective and distance scale from `config`.
    #[must_use]
    pub fn new(config: &AnnealConfig) -> Self {
        Self {
            nodes: SlotMap::with_key(),
            frames: Vec::new(),
            images: Vec::new(),
            objective: config.objective(),
            distance_divisor: config.global.distance_cost_divisor,
            pixels_per_micron: config.global.pixels_per_micron,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    #[must_use]
    pub const fn objective(&self) -> &Objective {
        &self.objective
    }

    #[must_use]
    pub fn frame(&self, index: usize) -> Option<&Frame> {
        self.frames.get(index)
    }

    #[must_use]
    pub fn images(&self, index: usize) -> Option<&FrameImages> {
        self.images.get(index)
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&CellNode> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut CellNode> {
        self.nodes.get_mut(id)
    }

    /// Current value of a node.
    #[must_use]
    pub fn cell(&self, id: NodeId) -> Option<&Cell> {
        self.nodes.get(id).map(CellNode::cell)
    }

    /// Number of nodes in the arena.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Children of a node's children.
    #[must_use]
    pub fn grandchildren(&self, id: NodeId) -> SmallVec<[NodeId; 4]> {
        let Some(node) = self.nodes.get(id) else {
            return SmallVec::new();
        };
        node.children
            .iter()
            .filter_map(|child| self.nodes.get(*child))
            .flat_map(|child| child.children.iter().copied())
            .collect()
    }

    /// Current cells of a frame in name order.
    #[must_use]
    pub fn cells(&self, index: usize) -> Vec<Cell> {
        self.frames
            .get(index)
            .map(|frame| {
                frame
                    .node_ids()
                    .filter_map(|id| self.cell(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Appends an empty frame showing `real`, rendered with `render`.
    pub fn forward(&mut self, real: Image<f64>, render: RenderParams) -> Result<usize, LineageError> {
        let (width, height) = (real.width(), real.height());
        let weights = match self.objective.kind {
            ObjectiveKind::Distance => Some(distance_weights(
                &real,
                self.distance_divisor,
                self.pixels_per_micron,
            )?),
            ObjectiveKind::Plain => None,
        };
        let (synth, occupancy) = render_cells(std::iter::empty(), width, height, &render)?;
        self.frames.push(Frame {
            nodes: BTreeMap::new(),
            render,
        });
        self.images.push(FrameImages {
            real,
            synth,
            occupancy,
            weights,
        });
        Ok(self.frames.len() - 1)
    }

    /// Appends a frame seeded with every cell of the current last frame.
    ///
    /// Render settings carry over and each copied cell becomes the child of
    /// its predecessor.
    pub fn copy_forward(&mut self, real: Image<f64>) -> Result<usize, LineageError> {
        let Some(last) = self.frames.len().checked_sub(1) else {
            return self.forward(real, RenderParams::default());
        };
        let render = self.frames[last].render;
        let cells = self.cells(last);
        let index = self.forward(real, render)?;
        for cell in cells {
            self.add_cell(index, cell)?;
        }
        self.render_frame(index)?;
        Ok(index)
    }

    /// Adds or replaces a cell in `frame`, linking it to the previous frame.
    ///
    /// A cell whose name, or whose ancestor's name, appears in the previous
    /// frame becomes that node's child; otherwise it starts a new root. The
    /// frame's buffers are not redrawn; call [`Lineage::render_frame`] once
    /// the frame is populated.
    pub fn add_cell(&mut self, frame: usize, cell: Cell) -> Result<NodeId, LineageError> {
        let target = self
            .frames
            .get(frame)
            .ok_or(LineageError::MissingFrame(frame))?;
        if let Some(id) = target.node(cell.name()) {
            let node = self.nodes.get_mut(id).ok_or(LineageError::MissingNode)?;
            node.current = cell;
            node.undo.clear();
            return Ok(id);
        }
        let parent = frame.checked_sub(1).and_then(|previous| {
            let previous = &self.frames[previous];
            previous
                .node(cell.name())
                .or_else(|| cell.ancestor_name().and_then(|name| previous.node(name)))
        });
        Ok(self.insert_node(frame, cell, parent))
    }

    // Creates a node, registers it in its frame, and links it under `parent`.
    fn insert_node(&mut self, frame: usize, cell: Cell, parent: Option<NodeId>) -> NodeId {
        let name = cell.name().to_string();
        let id = self.nodes.insert(CellNode::new(cell, frame, parent));
        if let Some(parent) = parent.and_then(|p| self.nodes.get_mut(p)) {
            parent.children.push(id);
        }
        self.frames[frame].nodes.insert(name, id);
        id
    }

    /// Sum of cell counts over frames `[start, end)`, clamped to the lineage.
    #[must_use]
    pub fn count_cells_in(&self, start: usize, end: usize) -> usize {
        let end = end.min(self.frames.len());
        let start = start.min(end);
        self.frames[start..end].iter().map(Frame::len).sum()
    }

    /// Picks a frame in `[start, end)` with probability proportional to its cell count.
    pub fn choose_random_frame_index<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        start: usize,
        end: usize,
    ) -> Option<usize> {
        let total = self.count_cells_in(start, end);
        if total == 0 {
            return None;
        }
        let mut threshold = rng.random_range(0..total);
        let end = end.min(self.frames.len());
        for index in start..end {
            let count = self.frames[index].len();
            if threshold < count {
                return Some(index);
            }
            threshold -= count;
        }
        None
    }

    /// Picks a node of `frame` uniformly.
    pub fn choose_random_node<R: Rng + ?Sized>(&self, rng: &mut R, frame: usize) -> Option<NodeId> {
        let frame = self.frames.get(frame)?;
        if frame.is_empty() {
            return None;
        }
        frame.node_ids().nth(rng.random_range(0..frame.len()))
    }

    /// Collapses every node's history to its current value.
    pub fn flatten(&mut self) {
        for node in self.nodes.values_mut() {
            node.flatten();
        }
    }

    /// Redraws a frame from scratch.
    ///
    /// Cells that cannot be rasterized are marked dormant first and skipped.
    /// Returns the number of cells that became dormant.
    pub fn render_frame(&mut self, index: usize) -> Result<usize, LineageError> {
        let frame = self
            .frames
            .get(index)
            .ok_or(LineageError::MissingFrame(index))?;
        let mut newly_dormant = 0;
        for id in frame.nodes.values() {
            if let Some(node) = self.nodes.get_mut(*id)
                && !node.dormant
                && !node.current.is_renderable()
            {
                warn!(frame = index, cell = node.current.name(), "cell cannot be rendered; marking dormant");
                node.dormant = true;
                newly_dormant += 1;
            }
        }
        let (synth, occupancy) = self.render_preview(index, frame.render, &HashMap::new())?;
        let images = &mut self.images[index];
        images.synth = synth;
        images.occupancy = occupancy;
        Ok(newly_dormant)
    }

    /// Redraws every frame.
    pub fn render_all(&mut self) -> Result<usize, LineageError> {
        let mut dormant = 0;
        for index in 0..self.frames.len() {
            dormant += self.render_frame(index)?;
        }
        Ok(dormant)
    }

    /// Renders a frame with `render` and some cells replaced, without storing the result.
    pub fn render_preview(
        &self,
        index: usize,
        render: RenderParams,
        replacements: &HashMap<NodeId, Cell>,
    ) -> Result<(Image<f64>, Image<Coverage>), LineageError> {
        let frame = self
            .frames
            .get(index)
            .ok_or(LineageError::MissingFrame(index))?;
        let images = &self.images[index];
        let cells = frame.nodes.values().filter_map(|id| {
            let node = self.nodes.get(*id)?;
            if node.dormant {
                return None;
            }
            Some(replacements.get(id).unwrap_or(&node.current))
        });
        Ok(render_cells(cells, images.width(), images.height(), &render)?)
    }

    /// Full objective of one frame as currently stored.
    #[must_use]
    pub fn frame_cost(&self, index: usize) -> Option<f64> {
        let images = self.images.get(index)?;
        Some(
            self.objective
                .frame_cost(&images.inputs(), &images.synth, &images.occupancy),
        )
    }

    /// Objective of a prospective full redraw of a frame.
    pub fn preview_cost(
        &self,
        index: usize,
        synth: &Image<f64>,
        occupancy: &Image<Coverage>,
    ) -> Option<f64> {
        let images = self.images.get(index)?;
        Some(self.objective.frame_cost(&images.inputs(), synth, occupancy))
    }

    /// Full objective summed over frames in `range`.
    #[must_use]
    pub fn total_cost(&self, range: Range<usize>) -> f64 {
        let end = range.end.min(self.frames.len());
        let start = range.start.min(end);
        (start..end)
            .into_par_iter()
            .filter_map(|index| self.frame_cost(index))
            .sum()
    }

    fn redraw(&self, index: usize, removed: &[&Cell], added: &[&Cell]) -> Option<Redraw> {
        let frame = self.frames.get(index)?;
        let images = self.images.get(index)?;
        let render = &frame.render;
        let touched = removed
            .iter()
            .chain(added)
            .fold(Region::EMPTY, |region, cell| region.union(&cell.region()));
        let radius = render.kernel_radius();
        let target = touched.expand(radius).clip(images.width(), images.height());
        let mut patch = Patch::crop(&images.occupancy, target.expand(radius));
        for cell in removed {
            cell.draw(&mut patch, DrawMode::Subtract);
        }
        for cell in added {
            cell.draw(&mut patch, DrawMode::Add);
        }
        let shaded = shade(&patch, render, target);
        Some(Redraw {
            patch,
            target,
            shaded,
        })
    }

    /// Cost change from swapping `removed` for `added` in one frame.
    ///
    /// Only the pixels those cells can influence are evaluated, before and
    /// after, so the difference is exact. Nothing is modified.
    #[must_use]
    pub fn redraw_delta(&self, index: usize, removed: &[&Cell], added: &[&Cell]) -> f64 {
        let Some(redraw) = self.redraw(index, removed, added) else {
            return 0.0;
        };
        let images = &self.images[index];
        let inputs = images.inputs();
        let before =
            self.objective
                .region_cost(&inputs, &images.synth, &images.occupancy, redraw.target);
        let after = self
            .objective
            .patch_cost(&inputs, &redraw.patch, &redraw.shaded, redraw.target);
        after - before
    }

    /// Swaps `removed` for `added` in one frame's buffers.
    pub fn commit_redraw(
        &mut self,
        index: usize,
        removed: &[&Cell],
        added: &[&Cell],
    ) -> Result<(), LineageError> {
        let redraw = self
            .redraw(index, removed, added)
            .ok_or(LineageError::MissingFrame(index))?;
        let images = &mut self.images[index];
        redraw.patch.write_into(&mut images.occupancy);
        for ((x, y), value) in redraw.target.pixels().zip(redraw.shaded) {
            if let Some(pixel) = images.synth.get_mut(x, y) {
                *pixel = value;
            }
        }
        Ok(())
    }

    /// Installs a full redraw produced by [`Lineage::render_preview`].
    pub fn commit_render(
        &mut self,
        index: usize,
        render: RenderParams,
        synth: Image<f64>,
        occupancy: Image<Coverage>,
    ) -> Result<(), LineageError> {
        let frame = self
            .frames
            .get_mut(index)
            .ok_or(LineageError::MissingFrame(index))?;
        frame.render = render;
        let images = &mut self.images[index];
        images.synth = synth;
        images.occupancy = occupancy;
        Ok(())
    }

    /// Replaces the render settings of a frame and redraws it.
    pub fn set_render(&mut self, index: usize, render: RenderParams) -> Result<(), LineageError> {
        let frame = self
            .frames
            .get_mut(index)
            .ok_or(LineageError::MissingFrame(index))?;
        frame.render = render;
        self.render_frame(index).map(|_| ())
    }

    /// Pushes a new value onto a node without touching the buffers.
    pub fn push_cell(&mut self, id: NodeId, cell: Cell) -> Result<(), LineageError> {
        self.nodes
            .get_mut(id)
            .ok_or(LineageError::MissingNode)?
            .push(cell);
        Ok(())
    }

    /// Replaces the children of `parent` in frame `frame` with nodes for `cells`.
    ///
    /// Former children are dropped from the frame and the arena; their own
    /// children are reattached to the new child with the same name, else to
    /// the new child they split from, else become roots. Returns the new
    /// child handles.
    pub fn replace_children(
        &mut self,
        parent: NodeId,
        frame: usize,
        cells: Vec<Cell>,
    ) -> Result<SmallVec<[NodeId; 2]>, LineageError> {
        if frame >= self.frames.len() {
            return Err(LineageError::MissingFrame(frame));
        }
        let former: SmallVec<[NodeId; 2]> = self
            .nodes
            .get_mut(parent)
            .ok_or(LineageError::MissingNode)?
            .children
            .drain(..)
            .collect();

        let mut orphans: SmallVec<[NodeId; 4]> = SmallVec::new();
        for id in former {
            if let Some(node) = self.nodes.remove(id) {
                self.frames[frame].nodes.remove(node.current.name());
                orphans.extend(node.children);
            }
        }

        let created: SmallVec<[NodeId; 2]> = cells
            .into_iter()
            .map(|cell| self.insert_node(frame, cell, Some(parent)))
            .collect();

        for orphan in orphans {
            let Some(cell) = self.nodes.get(orphan).map(|node| node.current.clone()) else {
                continue;
            };
            let name = cell.name();
            let named = |wanted: Option<&str>| {
                created.iter().copied().find(|id| {
                    self.nodes
                        .get(*id)
                        .is_some_and(|n| Some(n.current.name()) == wanted)
                })
            };
            let adopter = named(Some(name)).or_else(|| named(cell.ancestor_name()));
            if let Some(node) = self.nodes.get_mut(orphan) {
                node.parent = adopter;
            }
            match adopter.and_then(|id| self.nodes.get_mut(id)) {
                Some(adopter) => adopter.children.push(orphan),
                None => debug!(cell = %name, "no matching parent after lineage edit; node becomes a root"),
            }
        }
        Ok(created)
    }

    /// Current cells of every non-dormant node in a frame, keyed by node.
    #[must_use]
    pub fn live_cells(&self, index: usize) -> Vec<(NodeId, &Cell)> {
        self.frames
            .get(index)
            .map(|frame| {
                frame
                    .node_ids()
                    .filter_map(|id| {
                        let node = self.nodes.get(id)?;
                        (!node.dormant).then_some((id, &node.current))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}
