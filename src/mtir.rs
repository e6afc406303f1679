//! The mid-tier IR (MTIR) consumed by the register allocator.
//!
//! An MTIR [Graph] is an ordered sequence of [BasicBlock]s, each holding an optional phi list, an
//! ordered node list, and exactly one control node. Nodes are always referenced by a [NodeId]:
//! this is deliberately an index into one graph-wide array for efficiency reasons, and because the
//! allocation order of ids doubles as the program order the allocator relies on. Thus every node
//! created by the [GraphBuilder] has an id greater than all nodes created before it, and blocks
//! cover strictly increasing id ranges.
//!
//! Gap moves spliced in by the allocator are the one exception to "id order is program order":
//! they are appended to the arena (and so get large ids) but inserted mid-block. Queries that care
//! ([Graph::first_non_gap_move_id]) skip over them.
//!
//!
//! ## Values and liveness
//!
//! A node that produces a value carries a [ValueState]: its result operand, its next-use id, its
//! live-range end, the spill slot it has been assigned (at most one per lifetime), and the set of
//! registers that currently hold it. The last two are owned by the node but written by the
//! allocator as it walks the graph.
//!
//! Each [Input] records, besides the producing node and an operand, the id of the *next* use of
//! the same producer after this one. Consuming an input advances the producer's next-use to that
//! id; a producer whose next-use runs out is dead and its registers can be reused. These use
//! chains are computed by [GraphBuilder::build], which also extends the live range of any value
//! that is defined before a loop and used inside it to the loop's back edge, so that such values
//! stay materialized for the whole loop.
//!
//!
//! ## Join blocks
//!
//! A block with an incoming jump, or with more than one predecessor, carries a [BlockState]: one
//! [RegCell] per allocatable register describing which value must be in that register on entry.
//! The allocator fills these in as it processes the incoming edges. When two edges deliver the
//! same value in different places the cell is upgraded to a [RegMerge] record, one operand per
//! predecessor, from which downstream code generation emits the parallel moves for each edge.
//!
//! Phi-carrying joins must be reached only by unconditional edges (phi inputs are materialized at
//! the predecessor's control node); conditional edges into such a join have to be routed through
//! an empty edge-split block. The [GraphBuilder] checks this.

use crate::regalloc::RegT;
use index_vec::{Idx, IndexVec, index_vec};
use smallvec::SmallVec;
use std::fmt;

index_vec::define_index_type! {
    pub struct NodeId = u32;
}

index_vec::define_index_type! {
    pub struct BlockIdx = u32;
}

index_vec::define_index_type! {
    pub struct RegMergeIdx = u32;
}

/// The placement constraint an operand carries before allocation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum OperandPolicy<R> {
    /// The value lives in a fixed caller-frame slot (a negative index). Valid only on the results
    /// of [NodeKind::Parameter] nodes.
    FixedSlot(i32),
    /// The value must be placed in the given register.
    FixedReg(R),
    /// The value must be placed in some register.
    MustHaveRegister,
    /// The result must share the register of the given input. Valid only on results.
    SameAsInput(usize),
    /// The operand is read from wherever the producer currently is. Valid only on inputs.
    RegisterOrSlot,
    /// As [OperandPolicy::RegisterOrSlot], but the producer may also be a rematerializable
    /// constant. The allocator treats both identically. Valid only on inputs.
    RegisterOrSlotOrConstant,
}

/// A concrete location chosen by the allocator.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AllocatedOperand<R> {
    Reg(R),
    /// A stack slot. Non-negative indices are allocator-owned spill slots; negative indices
    /// address the incoming-parameter area of the caller's frame.
    Slot(i32),
}

impl<R: fmt::Display> fmt::Display for AllocatedOperand<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocatedOperand::Reg(r) => write!(f, "{r}"),
            AllocatedOperand::Slot(i) => write!(f, "stack[{i}]"),
        }
    }
}

/// An operand: a policy before allocation, a location afterwards.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Operand<R> {
    Unallocated(OperandPolicy<R>),
    Allocated(AllocatedOperand<R>),
}

impl<R: RegT> Operand<R> {
    pub fn is_allocated(&self) -> bool {
        matches!(self, Operand::Allocated(_))
    }

    /// The chosen location. Must only be called after allocation.
    pub fn allocated(&self) -> AllocatedOperand<R> {
        match self {
            Operand::Allocated(x) => *x,
            Operand::Unallocated(p) => panic!("operand still unallocated: {p:?}"),
        }
    }
}

/// A use of a value by another node.
#[derive(Clone, Debug)]
pub struct Input<R: RegT> {
    pub(crate) node: NodeId,
    pub(crate) operand: Operand<R>,
    /// The id of the next use of the same producer strictly after this one, if any. Filled in by
    /// the liveness prepass.
    pub(crate) next_use_id: Option<NodeId>,
}

impl<R: RegT> Input<R> {
    /// The producing node.
    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn operand(&self) -> &Operand<R> {
        &self.operand
    }

    pub fn next_use_id(&self) -> Option<NodeId> {
        self.next_use_id
    }

    /// The register this input was assigned. Must only be called after allocation, on inputs that
    /// ended up in a register.
    pub fn assigned_reg(&self) -> R {
        match self.operand {
            Operand::Allocated(AllocatedOperand::Reg(r)) => r,
            ref x => panic!("input not in a register: {x:?}"),
        }
    }
}

/// Static properties of a node the allocator must respect.
#[derive(Clone, Copy, Debug, Default)]
pub struct NodeProps {
    /// The node clobbers all registers; every live value must be spilled and the register file
    /// cleared before it executes.
    pub is_call: bool,
    /// The node may deoptimize; the frame must hold a memory image of every live value.
    pub can_deopt: bool,
}

/// The allocator-facing state of a value-producing node.
#[derive(Clone, Debug)]
pub struct ValueState<R: RegT> {
    pub(crate) result: Operand<R>,
    /// The id of the earliest unconsumed use, or `None` once the value is dead.
    pub(crate) next_use: Option<NodeId>,
    /// The id of the last use, or `None` for a value that is never used.
    pub(crate) live_range_end: Option<NodeId>,
    pub(crate) spill: Option<AllocatedOperand<R>>,
    /// The registers currently holding this value.
    pub(crate) regs: SmallVec<[R; 2]>,
}

impl<R: RegT> ValueState<R> {
    pub fn result(&self) -> &Operand<R> {
        &self.result
    }

    pub fn is_dead(&self) -> bool {
        self.next_use.is_none()
    }

    pub fn has_valid_live_range(&self) -> bool {
        self.live_range_end.is_some()
    }

    pub fn is_spilled(&self) -> bool {
        self.spill.is_some()
    }

    pub fn spill_slot(&self) -> Option<AllocatedOperand<R>> {
        self.spill
    }

    pub fn has_register(&self) -> bool {
        !self.regs.is_empty()
    }

    pub fn registers(&self) -> &[R] {
        &self.regs
    }
}

#[derive(Clone, Copy, Debug)]
pub enum NodeKind<R: RegT> {
    /// An incoming parameter, materialized by the caller in a fixed frame slot.
    Parameter,
    /// An ordinary mid-tier operation. The allocator does not interpret these any further; the
    /// name is only for diagnostics.
    Op { name: &'static str },
    /// A pseudo-operation at the start of a join block selecting one value per incoming edge.
    Phi,
    /// A move spliced in by the allocator to reconcile a value's location.
    GapMove {
        from: AllocatedOperand<R>,
        to: AllocatedOperand<R>,
    },
    Jump { target: BlockIdx },
    JumpLoop { target: BlockIdx },
    Branch { if_true: BlockIdx, if_false: BlockIdx },
    Return,
}

#[derive(Clone, Debug)]
pub struct Node<R: RegT> {
    pub(crate) kind: NodeKind<R>,
    pub(crate) props: NodeProps,
    pub(crate) inputs: SmallVec<[Input<R>; 2]>,
    pub(crate) num_temporaries_needed: u8,
    /// The free registers this node may use as temporaries, assigned by the allocator.
    pub(crate) temporaries: SmallVec<[R; 4]>,
    pub(crate) value: Option<ValueState<R>>,
    /// For forward control nodes, the next control-flow hole that post-dominates this one.
    pub(crate) next_post_dominating_hole: Option<NodeId>,
}

impl<R: RegT> Node<R> {
    pub fn kind(&self) -> &NodeKind<R> {
        &self.kind
    }

    pub fn props(&self) -> NodeProps {
        self.props
    }

    pub fn inputs(&self) -> &[Input<R>] {
        &self.inputs
    }

    pub fn input(&self, i: usize) -> &Input<R> {
        &self.inputs[i]
    }

    pub fn num_temporaries_needed(&self) -> u8 {
        self.num_temporaries_needed
    }

    pub fn temporaries(&self) -> &[R] {
        &self.temporaries
    }

    pub fn is_value(&self) -> bool {
        self.value.is_some()
    }

    /// The value state of this node. Panics if the node produces no value.
    pub fn value(&self) -> &ValueState<R> {
        self.value.as_ref().unwrap()
    }

    pub(crate) fn value_mut(&mut self) -> &mut ValueState<R> {
        self.value.as_mut().unwrap()
    }

    pub fn is_phi(&self) -> bool {
        matches!(self.kind, NodeKind::Phi)
    }

    pub fn is_gap_move(&self) -> bool {
        matches!(self.kind, NodeKind::GapMove { .. })
    }

    pub fn is_control(&self) -> bool {
        matches!(
            self.kind,
            NodeKind::Jump { .. }
                | NodeKind::JumpLoop { .. }
                | NodeKind::Branch { .. }
                | NodeKind::Return
        )
    }

    pub fn next_post_dominating_hole(&self) -> Option<NodeId> {
        self.next_post_dominating_hole
    }
}

/// One register's entry in a join block's [BlockState].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RegCell {
    /// No incoming edge has been processed yet.
    Uninit,
    /// Every edge seen so far delivers this value in this register (`None`: the register is dead
    /// on entry).
    Value(Option<NodeId>),
    /// Incoming edges disagree; the [RegMerge] record gives the per-edge source locations.
    Merge(RegMergeIdx),
}

/// A per-register merge record: the value that must end up in the register, and the location it
/// must be moved from along each incoming edge.
#[derive(Clone, Debug)]
pub struct RegMerge<R: RegT> {
    pub(crate) node: NodeId,
    pub(crate) operands: SmallVec<[AllocatedOperand<R>; 2]>,
}

impl<R: RegT> RegMerge<R> {
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// The source location for the edge with the given predecessor id.
    pub fn operand(&self, predecessor_id: u32) -> AllocatedOperand<R> {
        self.operands[predecessor_id as usize]
    }

    pub fn operands(&self) -> &[AllocatedOperand<R>] {
        &self.operands
    }
}

/// Entry state of a block with an incoming jump or more than one predecessor.
#[derive(Clone, Debug)]
pub struct BlockState<R: RegT> {
    pub(crate) predecessor_count: u32,
    pub(crate) register_state: IndexVec<R::RegIdx, RegCell>,
}

impl<R: RegT> BlockState<R> {
    pub fn predecessor_count(&self) -> u32 {
        self.predecessor_count
    }

    pub fn register_state(&self) -> &IndexVec<R::RegIdx, RegCell> {
        &self.register_state
    }

    /// Whether the first incoming edge has been processed. Cells are only ever written all at
    /// once, so probing one is enough.
    pub fn is_initialized(&self) -> bool {
        self.register_state[R::RegIdx::from_usize(0)] != RegCell::Uninit
    }
}

#[derive(Clone, Debug)]
pub struct BasicBlock<R: RegT> {
    pub(crate) phis: Vec<NodeId>,
    pub(crate) nodes: Vec<NodeId>,
    pub(crate) control: Option<NodeId>,
    pub(crate) state: Option<BlockState<R>>,
    /// This block's index among the predecessors of its unconditional successor. Only meaningful
    /// for blocks ending in a jump to a state-carrying block.
    pub(crate) predecessor_id: u32,
    /// An empty block created to split a conditional edge into a join.
    pub(crate) is_edge_split: bool,
}

impl<R: RegT> BasicBlock<R> {
    pub fn phis(&self) -> &[NodeId] {
        &self.phis
    }

    pub fn has_phis(&self) -> bool {
        !self.phis.is_empty()
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn control(&self) -> NodeId {
        self.control.unwrap()
    }

    pub fn state(&self) -> Option<&BlockState<R>> {
        self.state.as_ref()
    }

    pub fn has_state(&self) -> bool {
        self.state.is_some()
    }

    pub fn predecessor_id(&self) -> u32 {
        self.predecessor_id
    }

    pub fn is_edge_split(&self) -> bool {
        self.is_edge_split
    }
}

/// A control-flow graph of basic blocks in program order, plus the node arena and the per-join
/// merge records. Built by [GraphBuilder]; mutated in place by the allocator.
#[derive(Clone, Debug)]
pub struct Graph<R: RegT> {
    pub(crate) blocks: IndexVec<BlockIdx, BasicBlock<R>>,
    pub(crate) nodes: IndexVec<NodeId, Node<R>>,
    pub(crate) merges: IndexVec<RegMergeIdx, RegMerge<R>>,
    pub(crate) stack_slots: u32,
}

impl<R: RegT> Graph<R> {
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn block(&self, b: BlockIdx) -> &BasicBlock<R> {
        &self.blocks[b]
    }

    pub(crate) fn block_mut(&mut self, b: BlockIdx) -> &mut BasicBlock<R> {
        &mut self.blocks[b]
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, n: NodeId) -> &Node<R> {
        &self.nodes[n]
    }

    pub(crate) fn node_mut(&mut self, n: NodeId) -> &mut Node<R> {
        &mut self.nodes[n]
    }

    pub fn merge(&self, m: RegMergeIdx) -> &RegMerge<R> {
        &self.merges[m]
    }

    pub fn num_merges(&self) -> usize {
        self.merges.len()
    }

    pub(crate) fn merge_mut(&mut self, m: RegMergeIdx) -> &mut RegMerge<R> {
        &mut self.merges[m]
    }

    pub(crate) fn push_merge(&mut self, merge: RegMerge<R>) -> RegMergeIdx {
        self.merges.push(merge)
    }

    pub(crate) fn push_gap_move(
        &mut self,
        from: AllocatedOperand<R>,
        to: AllocatedOperand<R>,
    ) -> NodeId {
        self.nodes.push(Node {
            kind: NodeKind::GapMove { from, to },
            props: NodeProps::default(),
            inputs: SmallVec::new(),
            num_temporaries_needed: 0,
            temporaries: SmallVec::new(),
            value: None,
            next_post_dominating_hole: None,
        })
    }

    /// The number of spill slots the function needs. Recorded by the allocator.
    pub fn stack_slots(&self) -> u32 {
        self.stack_slots
    }

    pub(crate) fn set_stack_slots(&mut self, n: u32) {
        self.stack_slots = n;
    }

    /// The id of the first node of the block: the first phi if there is one, otherwise the first
    /// node that isn't a spliced-in gap move, otherwise the control node.
    pub fn first_id(&self, b: BlockIdx) -> NodeId {
        if let Some(&phi) = self.blocks[b].phis.first() {
            return phi;
        }
        self.first_non_gap_move_id(b)
    }

    /// As [Graph::first_id], but never a phi. Used for the loop-liveness bound, where gap moves
    /// already spliced into the target must not count.
    pub fn first_non_gap_move_id(&self, b: BlockIdx) -> NodeId {
        for &n in &self.blocks[b].nodes {
            if !self.nodes[n].is_gap_move() {
                return n;
            }
        }
        self.blocks[b].control()
    }
}

/// Constructs a [Graph] block by block.
///
/// Nodes (including control nodes) must be created in program order: all of a block's nodes, then
/// its control node, then the next block's nodes. Forward references to blocks are made by
/// reserving the [BlockIdx] with [GraphBuilder::block] first.
///
/// [GraphBuilder::build] wires predecessor lists and join states, checks structural rules, and
/// runs the liveness prepass that fills in next-use chains and live-range ends.
pub struct GraphBuilder<R: RegT> {
    graph: Graph<R>,
}

impl<R: RegT> Default for GraphBuilder<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: RegT> GraphBuilder<R> {
    pub fn new() -> Self {
        Self {
            graph: Graph {
                blocks: IndexVec::new(),
                nodes: IndexVec::new(),
                merges: IndexVec::new(),
                stack_slots: 0,
            },
        }
    }

    pub fn block(&mut self) -> BlockIdx {
        self.graph.blocks.push(BasicBlock {
            phis: Vec::new(),
            nodes: Vec::new(),
            control: None,
            state: None,
            predecessor_id: 0,
            is_edge_split: false,
        })
    }

    /// An empty block splitting a conditional edge into a join. Must be placed immediately after
    /// the branch that targets it and sealed with a jump to the join.
    pub fn edge_split_block(&mut self) -> BlockIdx {
        let b = self.block();
        self.graph.blocks[b].is_edge_split = true;
        b
    }

    fn push_node(&mut self, b: BlockIdx, node: Node<R>) -> NodeId {
        assert!(
            self.graph.blocks[b].control.is_none(),
            "block b{} is already sealed",
            b.index()
        );
        let id = self.graph.nodes.push(node);
        self.graph.blocks[b].nodes.push(id);
        id
    }

    /// An incoming parameter held in the caller-frame slot with the given (negative) index.
    pub fn parameter(&mut self, b: BlockIdx, slot: i32) -> NodeId {
        assert!(slot < 0, "parameter slots address the caller's frame");
        self.push_node(
            b,
            Node {
                kind: NodeKind::Parameter,
                props: NodeProps::default(),
                inputs: SmallVec::new(),
                num_temporaries_needed: 0,
                temporaries: SmallVec::new(),
                value: Some(ValueState {
                    result: Operand::Unallocated(OperandPolicy::FixedSlot(slot)),
                    next_use: None,
                    live_range_end: None,
                    spill: None,
                    regs: SmallVec::new(),
                }),
                next_post_dominating_hole: None,
            },
        )
    }

    /// Start an ordinary operation; finish it with [NodeBuilder::finish].
    pub fn op(&mut self, b: BlockIdx, name: &'static str) -> NodeBuilder<'_, R> {
        NodeBuilder {
            gb: self,
            block: b,
            name,
            inputs: SmallVec::new(),
            result: None,
            props: NodeProps::default(),
            num_temporaries: 0,
        }
    }

    /// A phi whose inputs are given in predecessor order.
    pub fn phi(&mut self, b: BlockIdx, inputs: &[NodeId]) -> NodeId {
        assert!(
            self.graph.blocks[b].control.is_none(),
            "block b{} is already sealed",
            b.index()
        );
        let inputs = inputs
            .iter()
            .map(|&n| Input {
                node: n,
                operand: Operand::Unallocated(OperandPolicy::RegisterOrSlotOrConstant),
                next_use_id: None,
            })
            .collect();
        let id = self.graph.nodes.push(Node {
            kind: NodeKind::Phi,
            props: NodeProps::default(),
            inputs,
            num_temporaries_needed: 0,
            temporaries: SmallVec::new(),
            value: Some(ValueState {
                result: Operand::Unallocated(OperandPolicy::MustHaveRegister),
                next_use: None,
                live_range_end: None,
                spill: None,
                regs: SmallVec::new(),
            }),
            next_post_dominating_hole: None,
        });
        self.graph.blocks[b].phis.push(id);
        id
    }

    /// Append a later predecessor's input to a phi. Loop phis are created while the header is
    /// being built, before their back-edge value exists; this wires it in once it does.
    pub fn add_phi_input(&mut self, phi: NodeId, n: NodeId) {
        assert!(self.graph.nodes[phi].is_phi());
        self.graph.nodes[phi].inputs.push(Input {
            node: n,
            operand: Operand::Unallocated(OperandPolicy::RegisterOrSlotOrConstant),
            next_use_id: None,
        });
    }

    fn seal(&mut self, b: BlockIdx, node: Node<R>) -> NodeId {
        assert!(
            self.graph.blocks[b].control.is_none(),
            "block b{} is already sealed",
            b.index()
        );
        let id = self.graph.nodes.push(node);
        self.graph.blocks[b].control = Some(id);
        id
    }

    pub fn jump(&mut self, b: BlockIdx, target: BlockIdx) -> NodeId {
        self.seal(
            b,
            Node {
                kind: NodeKind::Jump { target },
                props: NodeProps::default(),
                inputs: SmallVec::new(),
                num_temporaries_needed: 0,
                temporaries: SmallVec::new(),
                value: None,
                next_post_dominating_hole: None,
            },
        )
    }

    /// The back edge of a loop.
    pub fn jump_loop(&mut self, b: BlockIdx, target: BlockIdx) -> NodeId {
        assert!(target.index() <= b.index(), "back edges must point backwards");
        self.seal(
            b,
            Node {
                kind: NodeKind::JumpLoop { target },
                props: NodeProps::default(),
                inputs: SmallVec::new(),
                num_temporaries_needed: 0,
                temporaries: SmallVec::new(),
                value: None,
                next_post_dominating_hole: None,
            },
        )
    }

    pub fn branch(
        &mut self,
        b: BlockIdx,
        cond: NodeId,
        if_true: BlockIdx,
        if_false: BlockIdx,
    ) -> NodeId {
        let input = Input {
            node: cond,
            operand: Operand::Unallocated(OperandPolicy::MustHaveRegister),
            next_use_id: None,
        };
        self.seal(
            b,
            Node {
                kind: NodeKind::Branch { if_true, if_false },
                props: NodeProps::default(),
                inputs: smallvec::smallvec![input],
                num_temporaries_needed: 0,
                temporaries: SmallVec::new(),
                value: None,
                next_post_dominating_hole: None,
            },
        )
    }

    pub fn ret(&mut self, b: BlockIdx, value: NodeId) -> NodeId {
        let input = Input {
            node: value,
            operand: Operand::Unallocated(OperandPolicy::MustHaveRegister),
            next_use_id: None,
        };
        self.seal(
            b,
            Node {
                kind: NodeKind::Return,
                props: NodeProps::default(),
                inputs: smallvec::smallvec![input],
                num_temporaries_needed: 0,
                temporaries: SmallVec::new(),
                value: None,
                next_post_dominating_hole: None,
            },
        )
    }

    /// Wire up predecessors and join states, check structural rules, and run the liveness
    /// prepass.
    ///
    /// # Panics
    ///
    /// If the graph is malformed: an unsealed block, block order disagreeing with id order, a phi
    /// whose input count doesn't match its block's predecessor count, a phi-carrying join
    /// targeted by a conditional edge, or a misshapen edge-split block.
    pub fn build(mut self) -> Graph<R> {
        let nblocks = self.graph.blocks.len();
        for b in self.graph.blocks.iter() {
            assert!(b.control.is_some(), "unsealed block");
        }
        for w in 1..nblocks {
            let prev = BlockIdx::from_usize(w - 1);
            let cur = BlockIdx::from_usize(w);
            assert!(
                self.graph.first_id(prev).index() < self.graph.first_id(cur).index(),
                "block order must agree with id order"
            );
        }

        // Predecessor lists, in block order with branch arms left to right. This order defines
        // predecessor ids, and phi inputs must match it.
        let mut preds: IndexVec<BlockIdx, Vec<(BlockIdx, bool)>> = index_vec![Vec::new(); nblocks];
        for w in 0..nblocks {
            let b = BlockIdx::from_usize(w);
            match self.graph.nodes[self.graph.blocks[b].control()].kind {
                NodeKind::Jump { target } | NodeKind::JumpLoop { target } => {
                    preds[target].push((b, false));
                }
                NodeKind::Branch { if_true, if_false } => {
                    preds[if_true].push((b, true));
                    preds[if_false].push((b, true));
                }
                NodeKind::Return => (),
                ref k => panic!("not a control node: {k:?}"),
            }
        }

        for (t, list) in preds.iter_enumerated() {
            for (i, &(s, via_branch)) in list.iter().enumerate() {
                if !via_branch {
                    self.graph.blocks[s].predecessor_id = i as u32;
                }
            }
            let fallthrough = list.len() == 1 && {
                let (s, _) = list[0];
                self.graph.blocks[s].control().index() + 1 == self.graph.first_id(t).index()
            };
            let via_branch_only = list.len() == 1 && list[0].1;
            if self.graph.blocks[t].is_edge_split {
                assert!(
                    via_branch_only && fallthrough,
                    "an edge-split block must directly follow the branch that targets it"
                );
                assert!(
                    self.graph.blocks[t].nodes.is_empty()
                        && self.graph.blocks[t].phis.is_empty()
                        && matches!(
                            self.graph.nodes[self.graph.blocks[t].control()].kind,
                            NodeKind::Jump { .. }
                        ),
                    "an edge-split block must be empty and end in a jump"
                );
            } else if !list.is_empty() && !(via_branch_only && fallthrough) {
                self.graph.blocks[t].state = Some(BlockState {
                    predecessor_count: list.len() as u32,
                    register_state: index_vec![RegCell::Uninit; R::MAX_REGIDX.index()],
                });
            }
            if !self.graph.blocks[t].phis.is_empty() {
                assert!(list.len() >= 2, "phis need more than one predecessor");
                assert!(
                    list.iter().all(|&(_, via_branch)| !via_branch),
                    "conditional edges into a phi-carrying join must be split"
                );
                for &phi in &self.graph.blocks[t].phis {
                    assert_eq!(
                        self.graph.nodes[phi].inputs.len(),
                        list.len(),
                        "one phi input per predecessor"
                    );
                }
            }
        }

        self.compute_liveness(&preds);
        self.graph
    }

    /// Fill in next-use chains and live ranges.
    ///
    /// An ordinary input is a use at the consuming node; a phi's k-th input is a use at the k-th
    /// predecessor's control node, where the value is materialized for the edge. A value defined
    /// before a loop whose last use falls inside it additionally gets a synthetic use at the back
    /// edge, keeping it materialized for the whole loop.
    fn compute_liveness(&mut self, preds: &IndexVec<BlockIdx, Vec<(BlockIdx, bool)>>) {
        // (site, user and input index). Synthetic loop uses have no input to chain through.
        type Use = (NodeId, Option<(NodeId, usize)>);
        let mut uses: IndexVec<NodeId, Vec<Use>> = index_vec![Vec::new(); self.graph.nodes.len()];

        for w in 0..self.graph.blocks.len() {
            let b = BlockIdx::from_usize(w);
            let node_ids = self.graph.blocks[b]
                .nodes
                .iter()
                .copied()
                .chain([self.graph.blocks[b].control()])
                .collect::<Vec<_>>();
            for n in node_ids {
                for (i, input) in self.graph.nodes[n].inputs.iter().enumerate() {
                    assert!(
                        self.graph.nodes[input.node].is_value(),
                        "inputs must reference value nodes"
                    );
                    uses[input.node].push((n, Some((n, i))));
                }
            }
            for pi in 0..self.graph.blocks[b].phis.len() {
                let phi = self.graph.blocks[b].phis[pi];
                for (k, input) in self.graph.nodes[phi].inputs.iter().enumerate() {
                    assert!(self.graph.nodes[input.node].is_value());
                    let site = self.graph.blocks[preds[b][k].0].control();
                    uses[input.node].push((site, Some((phi, k))));
                }
            }
        }

        // Loop extension, innermost loops first (back edges appear in ascending id order).
        for w in 0..self.graph.blocks.len() {
            let b = BlockIdx::from_usize(w);
            let ctl = self.graph.blocks[b].control();
            let NodeKind::JumpLoop { target } = self.graph.nodes[ctl].kind else {
                continue;
            };
            let hfirst = self.graph.first_id(target).index();
            let jl = ctl.index();
            for v in 0..hfirst {
                let v = NodeId::from_usize(v);
                if !self.graph.nodes[v].is_value() || uses[v].is_empty() {
                    continue;
                }
                let last = uses[v].iter().map(|(s, _)| s.index()).max().unwrap();
                let used_in_loop = uses[v]
                    .iter()
                    .any(|(s, _)| hfirst <= s.index() && s.index() < jl);
                if used_in_loop && last < jl {
                    uses[v].push((ctl, None));
                }
            }
        }

        for us in uses.iter_mut() {
            us.sort_by_key(|&(site, who)| (site.index(), who.map(|(_, i)| i).unwrap_or(usize::MAX)));
        }
        for (v, us) in uses.iter_enumerated() {
            if us.is_empty() {
                continue;
            }
            assert!(self.graph.nodes[v].is_value());
            for w in 0..us.len() {
                let next_site = us.get(w + 1).map(|&(s, _)| s);
                if let (_, Some((user, idx))) = us[w] {
                    self.graph.nodes[user].inputs[idx].next_use_id = next_site;
                }
            }
            let val = self.graph.nodes[v].value_mut();
            val.next_use = Some(us[0].0);
            val.live_range_end = Some(us[us.len() - 1].0);
        }
    }
}

/// Builds one ordinary operation. Inputs default to [OperandPolicy::MustHaveRegister]; a node
/// without a `result_*` call produces no value.
pub struct NodeBuilder<'a, R: RegT> {
    gb: &'a mut GraphBuilder<R>,
    block: BlockIdx,
    name: &'static str,
    inputs: SmallVec<[Input<R>; 2]>,
    result: Option<OperandPolicy<R>>,
    props: NodeProps,
    num_temporaries: u8,
}

impl<'a, R: RegT> NodeBuilder<'a, R> {
    fn push_input(mut self, n: NodeId, policy: OperandPolicy<R>) -> Self {
        self.inputs.push(Input {
            node: n,
            operand: Operand::Unallocated(policy),
            next_use_id: None,
        });
        self
    }

    /// An input that must be in a register.
    pub fn input(self, n: NodeId) -> Self {
        self.push_input(n, OperandPolicy::MustHaveRegister)
    }

    /// An input read from wherever its producer currently is.
    pub fn input_any(self, n: NodeId) -> Self {
        self.push_input(n, OperandPolicy::RegisterOrSlot)
    }

    /// An input that must be in the given register.
    pub fn input_fixed(self, n: NodeId, reg: R) -> Self {
        self.push_input(n, OperandPolicy::FixedReg(reg))
    }

    pub fn result(mut self) -> Self {
        self.result = Some(OperandPolicy::MustHaveRegister);
        self
    }

    pub fn result_fixed(mut self, reg: R) -> Self {
        self.result = Some(OperandPolicy::FixedReg(reg));
        self
    }

    pub fn result_same_as(mut self, input: usize) -> Self {
        self.result = Some(OperandPolicy::SameAsInput(input));
        self
    }

    pub fn calls(mut self) -> Self {
        self.props.is_call = true;
        self
    }

    pub fn deopts(mut self) -> Self {
        self.props.can_deopt = true;
        self
    }

    pub fn temporaries(mut self, n: u8) -> Self {
        self.num_temporaries = n;
        self
    }

    pub fn finish(self) -> NodeId {
        let value = self.result.map(|policy| ValueState {
            result: Operand::Unallocated(policy),
            next_use: None,
            live_range_end: None,
            spill: None,
            regs: SmallVec::new(),
        });
        let name = self.name;
        let node = Node {
            kind: NodeKind::Op { name },
            props: self.props,
            inputs: self.inputs,
            num_temporaries_needed: self.num_temporaries,
            temporaries: SmallVec::new(),
            value,
            next_post_dominating_hole: None,
        };
        let block = self.block;
        self.gb.push_node(block, node)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::x64::Reg;

    #[test]
    fn ids_follow_creation_order() {
        let mut gb = GraphBuilder::<Reg>::new();
        let b0 = gb.block();
        let v0 = gb.op(b0, "a").result().finish();
        let v1 = gb.op(b0, "b").input(v0).result().finish();
        let ctl = gb.ret(b0, v1);
        assert_eq!(v0.index(), 0);
        assert_eq!(v1.index(), 1);
        assert_eq!(ctl.index(), 2);
        let g = gb.build();
        assert_eq!(g.first_id(b0), v0);
        assert_eq!(g.first_non_gap_move_id(b0), v0);
    }

    #[test]
    fn next_use_chains() {
        let mut gb = GraphBuilder::<Reg>::new();
        let b0 = gb.block();
        let v0 = gb.op(b0, "a").result().finish();
        let v1 = gb.op(b0, "b").input(v0).result().finish();
        let v2 = gb.op(b0, "c").input(v0).input(v1).result().finish();
        gb.ret(b0, v2);
        let g = gb.build();

        // v0 is used at v1 then at v2; v1 at v2; v2 at the return.
        assert_eq!(g.node(v0).value().next_use, Some(v1));
        assert_eq!(g.node(v0).value().live_range_end, Some(v2));
        assert_eq!(g.node(v1).input(0).next_use_id(), Some(v2));
        assert_eq!(g.node(v2).input(0).next_use_id(), None);
        assert_eq!(g.node(v1).value().next_use, Some(v2));
        assert_eq!(g.node(v2).value().live_range_end, Some(g.block(b0).control()));
    }

    #[test]
    fn repeated_input_chains_through_same_node() {
        let mut gb = GraphBuilder::<Reg>::new();
        let b0 = gb.block();
        let v0 = gb.op(b0, "a").result().finish();
        let v1 = gb.op(b0, "add").input(v0).input(v0).result().finish();
        gb.ret(b0, v1);
        let g = gb.build();

        // The first use of v0 at v1 chains to the second use at v1 itself.
        assert_eq!(g.node(v1).input(0).next_use_id(), Some(v1));
        assert_eq!(g.node(v1).input(1).next_use_id(), None);
        assert_eq!(g.node(v0).value().live_range_end, Some(v1));
    }

    #[test]
    fn unused_value_has_no_live_range() {
        let mut gb = GraphBuilder::<Reg>::new();
        let b0 = gb.block();
        let v0 = gb.op(b0, "a").result().finish();
        let v1 = gb.op(b0, "b").result().finish();
        gb.ret(b0, v1);
        let g = gb.build();
        assert!(g.node(v0).value().is_dead());
        assert!(!g.node(v0).value().has_valid_live_range());
    }

    #[test]
    fn join_blocks_get_state_and_predecessor_ids() {
        let mut gb = GraphBuilder::<Reg>::new();
        let b0 = gb.block();
        let b1 = gb.block();
        let b2 = gb.block();
        let b3 = gb.block();
        let vc = gb.op(b0, "cond").result().finish();
        gb.branch(b0, vc, b1, b2);
        let v1 = gb.op(b1, "x").result().finish();
        gb.jump(b1, b3);
        let v2 = gb.op(b2, "y").result().finish();
        gb.jump(b2, b3);
        let phi = gb.phi(b3, &[v1, v2]);
        gb.ret(b3, phi);
        let g = gb.build();

        // b1 falls through from the branch; b2 is reached by a non-fallthrough edge and needs its
        // own entry state; b3 is a two-predecessor join.
        assert!(!g.block(b1).has_state());
        assert!(g.block(b2).has_state());
        assert_eq!(g.block(b2).state().unwrap().predecessor_count(), 1);
        assert_eq!(g.block(b3).state().unwrap().predecessor_count(), 2);
        assert_eq!(g.block(b1).predecessor_id(), 0);
        assert_eq!(g.block(b2).predecessor_id(), 1);
        assert!(!g.block(b3).state().unwrap().is_initialized());
    }

    #[test]
    fn phi_uses_sit_on_predecessor_edges() {
        let mut gb = GraphBuilder::<Reg>::new();
        let b0 = gb.block();
        let b1 = gb.block();
        let b2 = gb.block();
        let b3 = gb.block();
        let vc = gb.op(b0, "cond").result().finish();
        gb.branch(b0, vc, b1, b2);
        let v1 = gb.op(b1, "x").result().finish();
        let j1 = gb.jump(b1, b3);
        let v2 = gb.op(b2, "y").result().finish();
        let j2 = gb.jump(b2, b3);
        let phi = gb.phi(b3, &[v1, v2]);
        gb.ret(b3, phi);
        let g = gb.build();

        // Each phi input is consumed at the corresponding predecessor's control node.
        assert_eq!(g.node(v1).value().live_range_end, Some(j1));
        assert_eq!(g.node(v2).value().live_range_end, Some(j2));
        assert_eq!(g.node(phi).value().next_use, Some(g.block(b3).control()));
    }

    #[test]
    fn loop_body_use_extends_live_range_to_back_edge() {
        let mut gb = GraphBuilder::<Reg>::new();
        let b0 = gb.block();
        let b1 = gb.block();
        let b2 = gb.block();
        let b3 = gb.block();
        let pre = gb.op(b0, "pre").result().finish();
        let init = gb.op(b0, "init").result().finish();
        gb.jump(b0, b1);
        let phi = gb.phi(b1, &[init]);
        let vc = gb.op(b1, "test").input(phi).result().finish();
        gb.branch(b1, vc, b2, b3);
        // `pre` is used in the body only; its live range must still reach the back edge.
        let nxt = gb.op(b2, "next").input(phi).input(pre).result().finish();
        gb.add_phi_input(phi, nxt);
        let jl = gb.jump_loop(b2, b1);
        gb.ret(b3, phi);
        let g = gb.build();

        assert_eq!(g.node(pre).value().live_range_end, Some(jl));
        // The body use chains to the synthetic back-edge use.
        assert_eq!(g.node(nxt).input(1).next_use_id(), Some(jl));
    }

    #[test]
    #[should_panic(expected = "one phi input per predecessor")]
    fn phi_input_count_must_match_predecessors() {
        let mut gb = GraphBuilder::<Reg>::new();
        let b0 = gb.block();
        let b1 = gb.block();
        let b2 = gb.block();
        let b3 = gb.block();
        let vc = gb.op(b0, "cond").result().finish();
        gb.branch(b0, vc, b1, b2);
        let v1 = gb.op(b1, "x").result().finish();
        gb.jump(b1, b3);
        gb.op(b2, "y").result().finish();
        gb.jump(b2, b3);
        gb.phi(b3, &[v1]);
        let r = gb.op(b3, "r").result().finish();
        gb.ret(b3, r);
        gb.build();
    }

    #[test]
    fn operand_display() {
        assert_eq!(
            AllocatedOperand::Reg(Reg::RAX).to_string(),
            "rax"
        );
        assert_eq!(AllocatedOperand::<Reg>::Slot(3).to_string(), "stack[3]");
        assert_eq!(AllocatedOperand::<Reg>::Slot(-1).to_string(), "stack[-1]");
    }
}
