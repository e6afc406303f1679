//! The straight-forward register allocator.
//!
//! This is a single-pass allocator: blocks are visited once, in program order, and every decision
//! is made locally. When a node needs a register and none is free, the value whose next use is
//! furthest in the future is evicted (moved to another register if one is free, spilled
//! otherwise). The only cross-block machinery is the per-join entry state: the first processed
//! edge into a join records which value each register holds, and every later edge reconciles its
//! own register file against that record, upgrading a register's cell to a [RegMerge] when two
//! edges deliver the same value from different locations. Downstream code generation turns those
//! records, and the per-edge operands injected into phi inputs, into parallel moves on the edges.
//!
//! The pass over the blocks is preceded by one reverse pass that computes, for all forward
//! control nodes (i.e. excluding `Return` and `JumpLoop`), a chain of post-dominating control
//! flow holes.
//!
//!
//! ## Post-dominating holes
//!
//! Control flow which interrupts linear fallthrough introduces a "hole": any jump that isn't a
//! fallthrough to the immediately next block qualifies, and conditionals start a region in which
//! holes occur. For each control node it is interesting to know the next hole that will be
//! reached *unconditionally* on the way to an exit: such holes post-dominate the current block.
//!
//! ```text
//!     b0: Jump ────┐        b0's jump skips b1, so it is a hole. Its chain continues at
//!     b1: ...      │        whatever post-dominates b2's control node.
//!     b2: ... ◄────┘
//! ```
//!
//! A non-fallthrough jump is its own nearest hole. A fallthrough jump and a conditional defer to
//! their chain link. For a conditional, the link is found by walking both arms' chains in id
//! order until they meet; if one arm exits first (a `Return` or a loop back edge), the chain
//! terminates at the other arm's node. Since only forward control matters, back edges are treated
//! like returns.
//!
//! The allocator itself reads the chains only for diagnostic tracing; they are computed here
//! because the reverse walk is shared with the rest of this pass's setup.
//!
//!
//! ## Loops
//!
//! Block order is expected to be a reverse post-order, so every predecessor of a join has been
//! processed when the join is reached, except for loop back edges. A loop header is therefore
//! allocated after seeing only its pre-loop edge; the back edge reconciles against the header's
//! state when it is finally processed. Crossing a back edge, a value counts as live only if it
//! was defined before the loop (phis of the header itself get their value from the edge's phi
//! moves instead, and so are excluded).

use crate::{
    CompilationError, log,
    mtir::{
        AllocatedOperand, BlockIdx, Graph, NodeId, NodeKind, Operand, OperandPolicy, RegCell,
        RegMerge,
    },
};
use index_vec::{Idx, IndexVec, index_vec};
use smallvec::{SmallVec, smallvec};
use std::fmt;
use vob::Vob;

/// An abstraction of an allocatable general-purpose register.
///
/// The allocator knows almost nothing about registers: every register converts to and from a
/// dense index in `[0, MAX_REGIDX)`, and "any free register" means the free register with the
/// lowest index, which keeps allocation deterministic.
pub trait RegT: Copy + fmt::Debug + fmt::Display + PartialEq {
    /// A register's index. Every register must be convertible to/from this type.
    type RegIdx: Idx;
    /// How many registers are available in this system?
    const MAX_REGIDX: Self::RegIdx;
    /// Make a register from a `RegIdx`.
    fn from_regidx(idx: Self::RegIdx) -> Self;
    /// What is this register's index?
    fn regidx(&self) -> Self::RegIdx;
}

/// Gates for two deliberately conservative spill behaviors, so that improving either is a local
/// change.
#[derive(Clone, Copy, Debug)]
pub struct SpillPolicy {
    /// At a node that can deoptimize, spill every live register holder (the registers stay
    /// occupied): the machine code must be able to find a memory image of all live state.
    pub spill_all_on_deopt: bool,
    /// Free the result register of a value with no uses as soon as it is allocated. Upstream
    /// dead-code elimination is incomplete, so such values do occur.
    pub free_dead_results: bool,
}

impl Default for SpillPolicy {
    fn default() -> Self {
        Self {
            spill_all_on_deopt: true,
            free_dead_results: true,
        }
    }
}

/// The most spill slots one function's frame may use.
const MAX_SPILL_SLOTS: i32 = 1 << 20;

/// Allocate registers for `graph` with the default [SpillPolicy].
pub fn allocate_registers<R: RegT>(graph: &mut Graph<R>) -> Result<(), CompilationError> {
    RegAlloc::new(graph, SpillPolicy::default()).run()
}

pub struct RegAlloc<'a, R: RegT> {
    graph: &'a mut Graph<R>,
    policy: SpillPolicy,
    /// The value each register currently holds.
    reg_values: IndexVec<R::RegIdx, Option<NodeId>>,
    /// Registers holding no live value. `reg_values[i]` is empty iff bit `i` is set.
    free_regs: Vob,
    /// Reclaimed spill slots, available for reuse. Slot 0 is never reclaimed.
    free_slots: Vec<i32>,
    top_of_stack: i32,
    cur_block: BlockIdx,
    /// Cursor into the current block's node list; gap moves are inserted here. Sits one past the
    /// end while the control node is being allocated, making insertions appends.
    node_pos: usize,
}

impl<'a, R: RegT> RegAlloc<'a, R> {
    pub fn new(graph: &'a mut Graph<R>, policy: SpillPolicy) -> Self {
        Self {
            graph,
            policy,
            reg_values: index_vec![None; R::MAX_REGIDX.index()],
            free_regs: Vob::from_elem(true, R::MAX_REGIDX.index()),
            free_slots: Vec::new(),
            top_of_stack: 0,
            cur_block: BlockIdx::from_usize(0),
            node_pos: 0,
        }
    }

    /// Run the allocator: compute the post-dominating hole chains, allocate every block, and
    /// record the frame's spill slot count on the graph.
    pub fn run(mut self) -> Result<(), CompilationError> {
        self.compute_post_dominating_holes();
        self.alloc_blocks()?;
        let top = self.top_of_stack as u32;
        self.graph.set_stack_slots(top);
        Ok(())
    }

    // ----- The reverse pass -----

    /// Link every forward control node to the nearest control-flow hole that post-dominates it
    /// (see the module docs). Blocks are walked in reverse, so a node's chain is complete by the
    /// time anything links to it.
    fn compute_post_dominating_holes(&mut self) {
        for w in (0..self.graph.num_blocks()).rev() {
            let b = BlockIdx::from_usize(w);
            let ctl = self.graph.block(b).control();
            match *self.graph.node(ctl).kind() {
                NodeKind::Jump { target } => {
                    let h =
                        self.nearest_post_dominating_hole(self.graph.block(target).control());
                    self.graph.node_mut(ctl).next_post_dominating_hole = Some(h);
                }
                NodeKind::Branch { if_true, if_false } => {
                    let mut first =
                        self.nearest_post_dominating_hole(self.graph.block(if_true).control());
                    let mut second =
                        self.nearest_post_dominating_hole(self.graph.block(if_false).control());
                    // Walk the chain that is behind until both arms reach the same hole. If the
                    // arm about to advance exits instead, the other arm's node is as far as
                    // control unconditionally gets.
                    while first != second {
                        if first.index() > second.index() {
                            std::mem::swap(&mut first, &mut second);
                        }
                        if matches!(
                            *self.graph.node(first).kind(),
                            NodeKind::Return | NodeKind::JumpLoop { .. }
                        ) {
                            first = second;
                            break;
                        }
                        first = self.graph.node(first).next_post_dominating_hole().unwrap();
                    }
                    self.graph.node_mut(ctl).next_post_dominating_hole = Some(first);
                }
                NodeKind::JumpLoop { .. } | NodeKind::Return => (),
                ref k => panic!("not a control node: {k:?}"),
            }
        }
    }

    /// The hole a control node stands for: itself for a non-fallthrough jump, a return or a back
    /// edge; its chain link for a fallthrough jump or a conditional (neither interrupts
    /// fallthrough by itself).
    fn nearest_post_dominating_hole(&self, ctl: NodeId) -> NodeId {
        match *self.graph.node(ctl).kind() {
            NodeKind::Branch { .. } => {
                self.graph.node(ctl).next_post_dominating_hole().unwrap()
            }
            NodeKind::Jump { target } => {
                if self.is_fallthrough(ctl, target) {
                    self.graph.node(ctl).next_post_dominating_hole().unwrap()
                } else {
                    ctl
                }
            }
            _ => ctl,
        }
    }

    /// A target is a fallthrough of a control node if its first id is the next id after the
    /// control node.
    fn is_fallthrough(&self, ctl: NodeId, target: BlockIdx) -> bool {
        ctl.index() + 1 == self.graph.first_id(target).index()
    }

    // ----- The forward pass -----

    fn alloc_blocks(&mut self) -> Result<(), CompilationError> {
        for w in 0..self.graph.num_blocks() {
            let b = BlockIdx::from_usize(w);
            self.cur_block = b;
            self.node_pos = 0;
            if self.graph.block(b).has_state() {
                self.initialize_register_values(b);
            }
            if log::should_log_ra() {
                self.trace_block_preamble(b);
            }
            if self.graph.block(b).has_phis() {
                self.place_phis(b)?;
            }
            while self.node_pos < self.graph.block(b).nodes().len() {
                let n = self.graph.block(b).nodes()[self.node_pos];
                self.alloc_node(n)?;
                self.node_pos += 1;
            }
            self.alloc_control_node(b)?;
            if cfg!(debug_assertions) {
                self.assert_file_integrity();
            }
        }
        Ok(())
    }

    /// Restore the register file from a join's entry state: values in cells become live, every
    /// other register becomes free.
    fn initialize_register_values(&mut self, b: BlockIdx) {
        // Drop every current holder's register set; the file is rebuilt from the join state.
        for w in 0..R::MAX_REGIDX.index() {
            let i = R::RegIdx::from_usize(w);
            if let Some(v) = self.reg_values[i] {
                self.graph.node_mut(v).value_mut().regs.clear();
            }
        }
        self.reg_values = index_vec![None; R::MAX_REGIDX.index()];
        self.free_regs = Vob::from_elem(false, R::MAX_REGIDX.index());

        let state = self.graph.block(b).state().unwrap();
        assert!(
            state.is_initialized(),
            "b{} reached before any of its predecessors",
            b.index()
        );
        let cells = state.register_state().iter().copied().collect::<Vec<_>>();
        for (w, cell) in cells.into_iter().enumerate() {
            let reg = R::from_regidx(R::RegIdx::from_usize(w));
            match cell {
                RegCell::Uninit => unreachable!(),
                RegCell::Value(None) => {
                    self.free_regs.set(w, true);
                }
                RegCell::Value(Some(v)) => self.set_register(reg, v),
                RegCell::Merge(m) => {
                    let v = self.graph.merge(m).node();
                    self.set_register(reg, v);
                }
            }
        }
    }

    /// Place the block's phis: reuse an input's register, then any free register, then a fresh
    /// spill slot. Competing phis are served in phi-list order.
    fn place_phis(&mut self, b: BlockIdx) -> Result<(), CompilationError> {
        let phis = self.graph.block(b).phis().to_vec();
        // Firstly, try to assign each phi to a register one of its inputs already arrives in.
        for &phi in &phis {
            self.try_allocate_to_input(phi)?;
        }
        // Secondly, try to assign remaining phis to any free register.
        for &phi in &phis {
            if self.graph.node(phi).value().result().is_allocated() {
                continue;
            }
            if let Some(op) = self.try_allocate_register(phi) {
                self.graph.node_mut(phi).value_mut().result = Operand::Allocated(op);
                if log::should_log_ra() {
                    log::log_ra(&format!("phi v{} (new reg) {op}", phi.index()));
                }
            }
        }
        // Finally just use a stack slot.
        for &phi in &phis {
            if self.graph.node(phi).value().result().is_allocated() {
                continue;
            }
            self.allocate_spill_slot(phi)?;
            let slot = self.graph.node(phi).value().spill_slot().unwrap();
            self.graph.node_mut(phi).value_mut().result = Operand::Allocated(slot);
            if log::should_log_ra() {
                log::log_ra(&format!("phi v{} (stack) {slot}", phi.index()));
            }
        }
        Ok(())
    }

    /// First-tier phi placement: if some input arrives in a register that is free on entry, put
    /// the phi there.
    fn try_allocate_to_input(&mut self, phi: NodeId) -> Result<(), CompilationError> {
        let n_inputs = self.graph.node(phi).inputs().len();
        for i in 0..n_inputs {
            let op = *self.graph.node(phi).input(i).operand();
            if let Operand::Allocated(AllocatedOperand::Reg(r)) = op {
                if self.reg_values[r.regidx()].is_none() {
                    let alloc = self.force_allocate(r, phi)?;
                    self.graph.node_mut(phi).value_mut().result = Operand::Allocated(alloc);
                    if log::should_log_ra() {
                        log::log_ra(&format!("phi v{} (reuse) {alloc}", phi.index()));
                    }
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn alloc_node(&mut self, n: NodeId) -> Result<(), CompilationError> {
        debug_assert!(!self.graph.node(n).is_control() && !self.graph.node(n).is_phi());
        let n_inputs = self.graph.node(n).inputs().len();
        for i in 0..n_inputs {
            self.assign_input(n, i)?;
        }
        self.assign_temporaries(n)?;
        for i in 0..n_inputs {
            self.update_input_use(n, i);
        }

        let props = self.graph.node(n).props();
        if props.is_call {
            self.spill_and_clear_registers()?;
        }
        if props.can_deopt && self.policy.spill_all_on_deopt {
            self.spill_registers()?;
        }

        if self.graph.node(n).is_value() {
            self.alloc_node_result(n)?;
        }
        if log::should_log_ra() {
            log::log_ra(&format!(
                "v{}: live regs: {}",
                n.index(),
                self.live_regs_string()
            ));
        }
        Ok(())
    }

    fn alloc_node_result(&mut self, n: NodeId) -> Result<(), CompilationError> {
        debug_assert!(!self.graph.node(n).is_phi());
        let policy = match *self.graph.node(n).value().result() {
            Operand::Unallocated(p) => p,
            Operand::Allocated(_) => unreachable!("result allocated twice"),
        };
        let alloc = match policy {
            OperandPolicy::FixedSlot(idx) => {
                debug_assert!(matches!(self.graph.node(n).kind(), NodeKind::Parameter));
                assert!(idx < 0);
                // The value starts life spilled in the caller's frame; it is exactly where the
                // caller put it.
                let loc = AllocatedOperand::Slot(idx);
                self.graph.node_mut(n).value_mut().spill = Some(loc);
                loc
            }
            OperandPolicy::FixedReg(r) => self.force_allocate(r, n)?,
            OperandPolicy::MustHaveRegister => self.allocate_register(n)?,
            OperandPolicy::SameAsInput(i) => {
                let r = self.graph.node(n).input(i).assigned_reg();
                self.force_allocate(r, n)?
            }
            OperandPolicy::RegisterOrSlot | OperandPolicy::RegisterOrSlotOrConstant => {
                unreachable!("policy invalid on results")
            }
        };
        self.graph.node_mut(n).value_mut().result = Operand::Allocated(alloc);
        if log::should_log_ra() {
            log::log_ra(&format!("v{}: result {alloc}", n.index()));
        }
        // Incomplete upstream dead-code elimination can hand us values that are never used; kill
        // the register use straight away.
        if self.policy.free_dead_results
            && !self.graph.node(n).value().has_valid_live_range()
            && matches!(alloc, AllocatedOperand::Reg(_))
        {
            self.free_all_registers_of(n);
            debug_assert!(self.graph.node(n).value().is_dead());
        }
        Ok(())
    }

    fn alloc_control_node(&mut self, b: BlockIdx) -> Result<(), CompilationError> {
        let ctl = self.graph.block(b).control();
        let n_inputs = self.graph.node(ctl).inputs().len();
        for i in 0..n_inputs {
            self.assign_input(ctl, i)?;
        }
        self.assign_temporaries(ctl)?;
        for i in 0..n_inputs {
            self.update_input_use(ctl, i);
        }

        if self.graph.node(ctl).props().is_call {
            self.spill_and_clear_registers()?;
        }

        // Inject this edge's allocation into the target's phis. Phi inputs only consume their
        // producers here, at the edge.
        if let NodeKind::Jump { target } | NodeKind::JumpLoop { target } =
            *self.graph.node(ctl).kind()
        {
            if self.graph.block(target).has_phis() {
                let pred_id = self.graph.block(b).predecessor_id() as usize;
                let phis = self.graph.block(target).phis().to_vec();
                for &phi in &phis {
                    let producer = self.graph.node(phi).input(pred_id).node();
                    let loc = self.allocation_of(producer);
                    self.graph.node_mut(phi).inputs[pred_id].operand = Operand::Allocated(loc);
                    if log::should_log_ra() {
                        log::log_ra(&format!(
                            "phi v{} input {pred_id} from {loc}",
                            phi.index()
                        ));
                    }
                }
                for &phi in &phis {
                    self.update_input_use(phi, pred_id);
                }
            }
        }

        if self.graph.node(ctl).props().can_deopt && self.policy.spill_all_on_deopt {
            self.spill_registers()?;
        }

        // Merge register values into the successors. Values only flowing into phis and not being
        // independently live have been killed above as their last use was consumed.
        match *self.graph.node(ctl).kind() {
            NodeKind::Jump { target } | NodeKind::JumpLoop { target } => {
                // Empty edge-split blocks were already merged at their predecessor's branch.
                if !self.graph.block(b).is_edge_split() {
                    let pred_id = self.graph.block(b).predecessor_id();
                    self.merge_register_values(ctl, target, pred_id)?;
                }
            }
            NodeKind::Branch { if_true, if_false } => {
                self.initialize_conditional_branch_registers(ctl, if_true)?;
                self.initialize_conditional_branch_registers(ctl, if_false)?;
            }
            NodeKind::Return => (),
            _ => unreachable!(),
        }
        Ok(())
    }

    // ----- Inputs, temporaries and uses -----

    fn assign_input(&mut self, user: NodeId, i: usize) -> Result<(), CompilationError> {
        let (producer, policy) = {
            let input = self.graph.node(user).input(i);
            let policy = match *input.operand() {
                Operand::Unallocated(p) => p,
                Operand::Allocated(_) => unreachable!("input allocated twice"),
            };
            (input.node(), policy)
        };
        let location = self.allocation_of(producer);
        let chosen = match policy {
            OperandPolicy::RegisterOrSlot | OperandPolicy::RegisterOrSlotOrConstant => location,
            OperandPolicy::FixedReg(r) => self.force_allocate(r, producer)?,
            OperandPolicy::MustHaveRegister => {
                if let AllocatedOperand::Reg(_) = location {
                    location
                } else {
                    self.allocate_register(producer)?
                }
            }
            OperandPolicy::FixedSlot(_) | OperandPolicy::SameAsInput(_) => {
                unreachable!("policy invalid on inputs")
            }
        };
        self.graph.node_mut(user).inputs[i].operand = Operand::Allocated(chosen);
        if location != chosen {
            if log::should_log_ra() {
                log::log_ra(&format!("gap move: {chosen} ← {location}"));
            }
            self.add_move_before_current(location, chosen);
        }
        Ok(())
    }

    /// Make sure at least as many registers are free as the node needs for temporaries, evicting
    /// values if necessary, and hand the node the whole free set to pick from.
    fn assign_temporaries(&mut self, n: NodeId) -> Result<(), CompilationError> {
        let needed = usize::from(self.graph.node(n).num_temporaries_needed());
        let mut free = self.free_regs.iter_set_bits(..).count();
        while free < needed {
            self.free_some_register()?;
            free += 1;
        }
        let temps = self
            .free_regs
            .iter_set_bits(..)
            .map(|w| R::from_regidx(R::RegIdx::from_usize(w)))
            .collect::<SmallVec<[R; 4]>>();
        debug_assert!(temps.len() >= needed);
        self.graph.node_mut(n).temporaries = temps;
        Ok(())
    }

    /// Advance the producer's next use past this input; if that kills the value, release its
    /// registers and recycle its spill slot.
    fn update_input_use(&mut self, user: NodeId, i: usize) {
        let (producer, next) = {
            let input = self.graph.node(user).input(i);
            (input.node(), input.next_use_id())
        };
        // The value may already have been cleared through a previous input.
        if self.graph.node(producer).value().is_dead() {
            return;
        }
        self.graph.node_mut(producer).value_mut().next_use = next;
        if next.is_none() {
            self.free_all_registers_of(producer);
            // A local spill slot can now hold some other value.
            if let Some(AllocatedOperand::Slot(idx)) = self.graph.node(producer).value().spill_slot()
            {
                if idx > 0 {
                    self.free_slots.push(idx);
                }
            }
        }
    }

    // ----- The register file -----

    /// The location a live value can currently be read from: its lowest-numbered register if it
    /// holds one, otherwise its spill slot.
    fn allocation_of(&self, v: NodeId) -> AllocatedOperand<R> {
        let val = self.graph.node(v).value();
        if let Some(r) = val
            .registers()
            .iter()
            .copied()
            .min_by_key(|r| r.regidx().index())
        {
            return AllocatedOperand::Reg(r);
        }
        if let Some(slot) = val.spill_slot() {
            return slot;
        }
        panic!("v{} has no materialized location", v.index());
    }

    fn set_register(&mut self, reg: R, v: NodeId) {
        let idx = reg.regidx();
        debug_assert!(self.reg_values[idx].is_none());
        self.reg_values[idx] = Some(v);
        let val = self.graph.node_mut(v).value_mut();
        debug_assert!(!val.regs.contains(&reg));
        val.regs.push(reg);
    }

    /// Take the lowest-numbered free register for `v`, if any.
    fn try_allocate_register(&mut self, v: NodeId) -> Option<AllocatedOperand<R>> {
        let w = self.free_regs.iter_set_bits(..).next()?;
        self.free_regs.set(w, false);
        let reg = R::from_regidx(R::RegIdx::from_usize(w));
        self.set_register(reg, v);
        Some(AllocatedOperand::Reg(reg))
    }

    /// Allocate some register for `v`, evicting the furthest-next-use value if none is free.
    fn allocate_register(&mut self, v: NodeId) -> Result<AllocatedOperand<R>, CompilationError> {
        if self.free_regs.iter_set_bits(..).next().is_none() {
            self.free_some_register()?;
        }
        Ok(self.try_allocate_register(v).unwrap())
    }

    /// Put `v` into `reg`, whatever it takes: displace the current holder, or take the register
    /// out of the free set.
    fn force_allocate(&mut self, reg: R, v: NodeId) -> Result<AllocatedOperand<R>, CompilationError> {
        let idx = reg.regidx();
        if self.reg_values[idx].is_none() {
            // If it's already free, remove it from the free set.
            self.free_regs.set(idx.index(), false);
        } else if self.reg_values[idx] == Some(v) {
            return Ok(AllocatedOperand::Reg(reg));
        } else {
            self.free_reg(reg)?;
            debug_assert!(self.reg_values[idx].is_none());
        }
        self.set_register(reg, v);
        Ok(AllocatedOperand::Reg(reg))
    }

    /// Evict the occupied register whose holder's next use is furthest in the future and mark it
    /// free.
    fn free_some_register(&mut self) -> Result<(), CompilationError> {
        let mut furthest = 0;
        let mut longest: Option<R::RegIdx> = None;
        for (i, v) in self.reg_values.iter_enumerated() {
            let Some(v) = *v else { continue };
            // A dead holder (possible when dead results are kept) is as far from its next use as
            // it gets.
            let use_ = self
                .graph
                .node(v)
                .value()
                .next_use
                .map(|u| u.index() + 1)
                .unwrap_or(usize::MAX);
            if use_ > furthest {
                furthest = use_;
                longest = Some(i);
            }
        }
        let longest = longest.expect("evicting with no occupied registers");
        let reg = R::from_regidx(longest);
        if log::should_log_ra() {
            log::log_ra(&format!("evict {reg}"));
        }
        self.evict_reg(reg)?;
        self.free_regs.set(longest.index(), true);
        Ok(())
    }

    /// Evict the value held by `reg`, spilling it if this was its only location. Unlike
    /// [RegAlloc::free_reg] this never shuffles the value into another free register: eviction
    /// exists to lower register pressure, and any free register may already be spoken for by the
    /// temporaries being reserved.
    fn evict_reg(&mut self, reg: R) -> Result<(), CompilationError> {
        let idx = reg.regidx();
        let Some(v) = self.reg_values[idx] else {
            return Ok(());
        };
        self.reg_values[idx] = None;
        let (has_reg, spilled) = {
            let val = self.graph.node_mut(v).value_mut();
            val.regs.retain(|r| *r != reg);
            (!val.regs.is_empty(), val.spill.is_some())
        };
        if has_reg || spilled {
            return Ok(());
        }
        self.spill_value(v)
    }

    /// Remove the value held by `reg`: if this was its last register and it has no memory copy,
    /// move it to another free register (emitting a gap move), else spill it. `reg` itself is
    /// left out of the free set; the caller decides what happens to it.
    fn free_reg(&mut self, reg: R) -> Result<(), CompilationError> {
        let idx = reg.regidx();
        let Some(v) = self.reg_values[idx] else {
            return Ok(());
        };
        self.reg_values[idx] = None;
        let (has_reg, spilled) = {
            let val = self.graph.node_mut(v).value_mut();
            val.regs.retain(|r| *r != reg);
            (!val.regs.is_empty(), val.spill.is_some())
        };
        // If the value is still in another register, or already has a memory copy, it needs no
        // rescue.
        if has_reg || spilled {
            return Ok(());
        }
        if let Some(w) = self.free_regs.iter_set_bits(..).next() {
            let target = R::from_regidx(R::RegIdx::from_usize(w));
            self.free_regs.set(w, false);
            self.set_register(target, v);
            if log::should_log_ra() {
                log::log_ra(&format!("gap move: v{}: {target} ← {reg}", v.index()));
            }
            self.add_move_before_current(
                AllocatedOperand::Reg(reg),
                AllocatedOperand::Reg(target),
            );
            return Ok(());
        }
        // If all else fails, spill the value.
        self.spill_value(v)
    }

    /// Release every register `v` holds back into the free set.
    fn free_all_registers_of(&mut self, v: NodeId) {
        let regs = std::mem::take(&mut self.graph.node_mut(v).value_mut().regs);
        for r in regs {
            let i = r.regidx();
            debug_assert_eq!(self.reg_values[i], Some(v));
            self.reg_values[i] = None;
            self.free_regs.set(i.index(), true);
        }
    }

    // ----- Spill slots -----

    /// Give `v` a memory location if it doesn't have one. No store is emitted here: the code
    /// generator spills the value at its definition.
    fn spill_value(&mut self, v: NodeId) -> Result<(), CompilationError> {
        if self.graph.node(v).value().spill.is_some() {
            return Ok(());
        }
        self.allocate_spill_slot(v)?;
        if log::should_log_ra() {
            let slot = self.graph.node(v).value().spill_slot().unwrap();
            log::log_ra(&format!("spill: {slot} ← v{}", v.index()));
        }
        Ok(())
    }

    fn allocate_spill_slot(&mut self, v: NodeId) -> Result<(), CompilationError> {
        debug_assert!(self.graph.node(v).value().spill.is_none());
        let slot = match self.free_slots.pop() {
            Some(s) => s,
            None => {
                if self.top_of_stack >= MAX_SPILL_SLOTS {
                    return Err(CompilationError::LimitExceeded(format!(
                        "frame needs more than {MAX_SPILL_SLOTS} spill slots"
                    )));
                }
                let s = self.top_of_stack;
                self.top_of_stack += 1;
                s
            }
        };
        self.graph.node_mut(v).value_mut().spill = Some(AllocatedOperand::Slot(slot));
        Ok(())
    }

    /// Give every live register holder a memory copy, keeping the registers occupied.
    fn spill_registers(&mut self) -> Result<(), CompilationError> {
        for w in 0..R::MAX_REGIDX.index() {
            let i = R::RegIdx::from_usize(w);
            if let Some(v) = self.reg_values[i] {
                self.spill_value(v)?;
            }
        }
        Ok(())
    }

    /// Spill every live register holder and empty the register file (a call clobbers
    /// everything).
    fn spill_and_clear_registers(&mut self) -> Result<(), CompilationError> {
        for w in 0..R::MAX_REGIDX.index() {
            let i = R::RegIdx::from_usize(w);
            if let Some(v) = self.reg_values[i] {
                self.spill_value(v)?;
                self.free_all_registers_of(v);
            }
        }
        Ok(())
    }

    // ----- Gap moves -----

    /// Splice a move into the instruction stream just before the node being allocated. While the
    /// control node is being allocated the move is appended to the ordinary-node list instead.
    fn add_move_before_current(&mut self, from: AllocatedOperand<R>, to: AllocatedOperand<R>) {
        let gap = self.graph.push_gap_move(from, to);
        let b = self.cur_block;
        let nodes = &mut self.graph.block_mut(b).nodes;
        if self.node_pos >= nodes.len() {
            // We're at the control node, so append instead.
            nodes.push(gap);
            self.node_pos = nodes.len();
        } else {
            nodes.insert(self.node_pos, gap);
            self.node_pos += 1;
        }
    }

    // ----- Merging at joins -----

    /// Is `v` still live when control reaches `target`? Crossing a back edge, only values defined
    /// before the loop count (the header's phis get their value from the edge's phi moves
    /// instead); forwards, the value's live range must reach the target's first node.
    fn is_live_at_target(&self, v: Option<NodeId>, source_ctl: NodeId, target: BlockIdx) -> bool {
        let Some(v) = v else { return false };
        if self.graph.node(v).value().is_dead() {
            return false;
        }
        if self.graph.block(target).control().index() <= source_ctl.index() {
            return v.index() < self.graph.first_id(target).index();
        }
        match self.graph.node(v).value().live_range_end {
            Some(end) => end.index() >= self.graph.first_id(target).index(),
            None => false,
        }
    }

    /// Record the current register file as a join's entry state: one cell per register, holding
    /// the value that is live into the target (or nothing).
    fn initialize_branch_target_register_values(&mut self, source_ctl: NodeId, target: BlockIdx) {
        let cells = (0..R::MAX_REGIDX.index())
            .map(|w| {
                let i = R::RegIdx::from_usize(w);
                let v = self
                    .reg_values[i]
                    .filter(|&v| self.is_live_at_target(Some(v), source_ctl, target));
                RegCell::Value(v)
            })
            .collect::<Vec<_>>();
        let state = self
            .graph
            .block_mut(target)
            .state
            .as_mut()
            .expect("target must carry entry state");
        assert!(!state.is_initialized(), "join state initialized twice");
        for (w, cell) in cells.into_iter().enumerate() {
            state.register_state[R::RegIdx::from_usize(w)] = cell;
        }
    }

    /// Process one conditional edge. An empty edge-split target stands for its successor: merge
    /// straight into that. A state-carrying target gets its entry state seeded from the current
    /// file. A plain fall-through just drops registers that are dead on the other side.
    fn initialize_conditional_branch_registers(
        &mut self,
        ctl: NodeId,
        target: BlockIdx,
    ) -> Result<(), CompilationError> {
        if self.graph.block(target).is_edge_split() {
            // Jumping over an empty block, so we're in fact merging.
            let jump = self.graph.block(target).control();
            let NodeKind::Jump { target: ultimate } = *self.graph.node(jump).kind() else {
                unreachable!("edge-split blocks end in a jump");
            };
            let pred_id = self.graph.block(target).predecessor_id();
            return self.merge_register_values(ctl, ultimate, pred_id);
        }
        if self.graph.block(target).has_state() {
            // Not a fall-through branch, copy the state over.
            self.initialize_branch_target_register_values(ctl, target);
            return Ok(());
        }
        // Clear dead fall-through registers.
        assert_eq!(ctl.index() + 1, self.graph.first_id(target).index());
        for w in 0..R::MAX_REGIDX.index() {
            let i = R::RegIdx::from_usize(w);
            if let Some(v) = self.reg_values[i] {
                if !self.is_live_at_target(Some(v), ctl, target) {
                    self.free_all_registers_of(v);
                }
            }
        }
        Ok(())
    }

    /// Reconcile the current register file with a join's entry state for the edge with the given
    /// predecessor id. The first edge to arrive just records the file; later edges record, per
    /// register, where this edge keeps the expected value, upgrading the cell to a [RegMerge]
    /// the first time an edge disagrees.
    fn merge_register_values(
        &mut self,
        ctl: NodeId,
        target: BlockIdx,
        pred_id: u32,
    ) -> Result<(), CompilationError> {
        let initialized = self
            .graph
            .block(target)
            .state()
            .expect("jump target must carry entry state")
            .is_initialized();
        if !initialized {
            // This is the first edge we're merging, initialize the values.
            self.initialize_branch_target_register_values(ctl, target);
            return Ok(());
        }

        let pred_count = self.graph.block(target).state().unwrap().predecessor_count() as usize;
        for w in 0..R::MAX_REGIDX.index() {
            let i = R::RegIdx::from_usize(w);
            let reg = R::from_regidx(i);
            let cell = self.graph.block(target).state().unwrap().register_state[i];
            let (node, merge) = match cell {
                RegCell::Uninit => unreachable!(),
                RegCell::Value(n) => (n, None),
                RegCell::Merge(m) => (Some(self.graph.merge(m).node()), Some(m)),
            };
            let register_info = AllocatedOperand::Reg(reg);
            let incoming = self
                .reg_values[i]
                .filter(|&v| self.is_live_at_target(Some(v), ctl, target));

            if incoming == node {
                // We're using the same register as the target already has. If registers are
                // merged, add input information.
                if let Some(m) = merge {
                    self.graph.merge_mut(m).operands[pred_id as usize] = register_info;
                }
                continue;
            }

            if let Some(m) = merge {
                // The register is already occupied with a different node. Figure out where that
                // node is allocated on the incoming branch.
                let expected = node.unwrap();
                let loc = self.allocation_of(expected);
                self.graph.merge_mut(m).operands[pred_id as usize] = loc;
                // If there's a value in the incoming state, that value is either already spilled
                // or in another place in the merge state.
                if let Some(incoming) = incoming {
                    if self.graph.node(incoming).value().is_spilled() {
                        self.ensure_in_register(target, incoming);
                    }
                }
                continue;
            }

            debug_assert!(node.is_some() || incoming.is_some());
            if node.is_none() && !self.graph.node(incoming.unwrap()).value().is_spilled() {
                // If the register is unallocated at the merge point, and the incoming value
                // isn't spilled, that means we must have seen it already in a different
                // register.
                self.ensure_in_register(target, incoming.unwrap());
                continue;
            }

            // Upgrade the cell to a merge. Every operand starts out as the info so far: the
            // register itself when all earlier edges agreed on it, or the incoming value's spill
            // slot when the cell was empty. Predecessors we haven't seen yet will simply
            // overwrite their entry later.
            let merge_node = node.unwrap_or_else(|| incoming.unwrap());
            let info_so_far = match node {
                None => self
                    .graph
                    .node(incoming.unwrap())
                    .value()
                    .spill_slot()
                    .unwrap(),
                Some(_) => register_info,
            };
            let mut operands: SmallVec<[AllocatedOperand<R>; 2]> =
                smallvec![info_so_far; pred_count];
            operands[pred_id as usize] = match node {
                None => register_info,
                Some(n) => self.allocation_of(n),
            };
            if log::should_log_ra() {
                log::log_ra(&format!(
                    "merge b{}: {reg} carries v{}",
                    target.index(),
                    merge_node.index()
                ));
            }
            let m = self.graph.push_merge(RegMerge {
                node: merge_node,
                operands,
            });
            self.graph.block_mut(target).state.as_mut().unwrap().register_state[i] =
                RegCell::Merge(m);
        }
        Ok(())
    }

    /// A live value this edge holds in a register the join doesn't expect it in must still reach
    /// the target somehow: some cell has to mention it.
    fn ensure_in_register(&self, target: BlockIdx, incoming: NodeId) {
        let state = self.graph.block(target).state().unwrap();
        let found = state.register_state().iter().any(|cell| match *cell {
            RegCell::Uninit => false,
            RegCell::Value(n) => n == Some(incoming),
            RegCell::Merge(m) => self.graph.merge(m).node() == incoming,
        });
        assert!(
            found,
            "v{} missing from the entry state of b{}",
            incoming.index(),
            target.index()
        );
    }

    // ----- Diagnostics -----

    fn live_regs_string(&self) -> String {
        let mut parts = Vec::new();
        for (i, v) in self.reg_values.iter_enumerated() {
            if let Some(v) = v {
                parts.push(format!("{}=v{}", R::from_regidx(i), v.index()));
            }
        }
        if parts.is_empty() {
            "(none)".to_owned()
        } else {
            parts.join(", ")
        }
    }

    /// Trace the block's entry file and the chain of holes downstream of its control node.
    fn trace_block_preamble(&self, b: BlockIdx) {
        let mut s = format!("b{}: live regs: {}", b.index(), self.live_regs_string());
        let ctl = self.graph.block(b).control();
        let mut hole = self.nearest_post_dominating_hole(ctl);
        if !matches!(*self.graph.node(hole).kind(), NodeKind::JumpLoop { .. }) {
            s.push_str(" [holes:");
            loop {
                match *self.graph.node(hole).kind() {
                    NodeKind::Jump { target } => {
                        s.push_str(&format!(
                            " {}-{}",
                            hole.index(),
                            self.graph.first_id(target).index()
                        ));
                        hole = self.graph.node(hole).next_post_dominating_hole().unwrap();
                    }
                    NodeKind::Return => {
                        s.push_str(&format!(" {}.", hole.index()));
                        break;
                    }
                    NodeKind::JumpLoop { .. } => {
                        s.push_str(&format!(" {}^", hole.index()));
                        break;
                    }
                    _ => unreachable!(),
                }
            }
            s.push(']');
        }
        log::log_ra(&s);
    }

    /// The register file, the free set and the per-value register sets must agree between
    /// blocks.
    fn assert_file_integrity(&self) {
        for (i, v) in self.reg_values.iter_enumerated() {
            assert_eq!(
                v.is_none(),
                self.free_regs.get(i.index()) == Some(true),
                "free set out of sync for register index {}",
                i.index()
            );
            if let Some(v) = *v {
                let val = self.graph.node(v).value();
                assert!(val.registers().iter().any(|r| r.regidx() == i));
                if self.policy.free_dead_results {
                    assert!(!val.is_dead(), "dead v{} left in the register file", v.index());
                }
            }
        }
    }
}
