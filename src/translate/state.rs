use std::collections::{BTreeMap, BTreeSet};

use crate::cfg::{NodeId, NodeKind, ProcDesc, block_leaders};
use crate::error::TranslateError;
use crate::exceptions::{ExceptionRegions, HandlerTarget};
use crate::ir::{Instruction, MethodBody, MethodDef};
use crate::sil::expr::{Expr, Ident, RETURN_VAR, THIS_VAR};
use crate::sil::instr::{CallArg, CallFlags, IfKind, Instr, Location};
use crate::sil::types::Typ;

const OBJECT_TYPE: &str = "System.Object";
pub(crate) const UNWRAP_EXCEPTION: &str = "__unwrap_exception";
pub(crate) const INSTANCEOF: &str = "__instanceof";

/// Symbolic operand-stack entry.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct StackValue {
    pub(crate) expr: Expr,
    pub(crate) typ: Typ,
}

impl StackValue {
    pub(crate) fn new(expr: Expr, typ: Typ) -> Self {
        Self { expr, typ }
    }
}

/// Where control goes when a finally body reaches `endfinally`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum FinallyExit {
    /// Entered through `leave`; continue at the leave target.
    Continue(u32),
    /// Entered exceptionally; rethrow the exception held by the identifier.
    Rethrow(Ident),
}

/// How a pending offset relates to the node being built.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Continuation {
    /// The offset starts a new block.
    NewBlock,
    /// IR for the offset is appended to the node.
    Append(NodeId),
    /// The block started earlier but has not produced a node yet.
    Deferred {
        block_start: u32,
        block_stack: Vec<StackValue>,
    },
}

/// Worklist entry: everything needed to resume translation at `offset`.
#[derive(Clone, Debug)]
pub(crate) struct Pending {
    pub(crate) offset: u32,
    pub(crate) prev: NodeId,
    pub(crate) stack: Vec<StackValue>,
    pub(crate) next_ident: u32,
    pub(crate) continuation: Continuation,
    pub(crate) finally_exit: Option<FinallyExit>,
}

/// Per-method translation state: operand stack, worklist, offset cache and the procedure
/// under construction.
pub(crate) struct TranslationState<'a> {
    declaring_type: &'a str,
    method: &'a MethodDef,
    instructions: &'a [Instruction],
    locals: &'a [String],
    index_by_offset: BTreeMap<u32, usize>,
    regions: ExceptionRegions,
    leaders: BTreeSet<u32>,
    procedure: ProcDesc,
    source_file: String,
    worklist: Vec<Pending>,
    node_cache: BTreeMap<u32, Vec<(NodeId, Vec<StackValue>)>>,
    handler_entries: BTreeMap<u32, NodeId>,
    visits: BTreeMap<u32, usize>,
    offset: u32,
    prev: NodeId,
    current: Option<NodeId>,
    block_start: u32,
    block_stack: Vec<StackValue>,
    stack: Vec<StackValue>,
    next_ident: u32,
    finally_exit: Option<FinallyExit>,
    location: Location,
}

impl<'a> TranslationState<'a> {
    pub(crate) fn new(
        declaring_type: &'a str,
        method: &'a MethodDef,
        body: &'a MethodBody,
        procedure: ProcDesc,
    ) -> Self {
        let regions = ExceptionRegions::analyze(&body.exception_handlers, &body.instructions);
        let leaders = block_leaders(&body.instructions, regions.boundaries());
        let index_by_offset = body
            .instructions
            .iter()
            .enumerate()
            .map(|(index, instruction)| (instruction.offset, index))
            .collect();
        let source_file = method.source_file.clone().unwrap_or_default();
        let location = procedure.attributes.loc.clone();
        let start = procedure.start();
        TranslationState {
            declaring_type,
            method,
            instructions: &body.instructions,
            locals: &body.locals,
            index_by_offset,
            regions,
            leaders,
            procedure,
            source_file,
            worklist: Vec::new(),
            node_cache: BTreeMap::new(),
            handler_entries: BTreeMap::new(),
            visits: BTreeMap::new(),
            offset: 0,
            prev: start,
            current: None,
            block_start: 0,
            block_stack: Vec::new(),
            stack: Vec::new(),
            next_ident: 0,
            finally_exit: None,
            location,
        }
    }

    pub(crate) fn method(&self) -> &'a MethodDef {
        self.method
    }

    pub(crate) fn regions(&self) -> &ExceptionRegions {
        &self.regions
    }

    pub(crate) fn procedure_mut(&mut self) -> &mut ProcDesc {
        &mut self.procedure
    }

    pub(crate) fn into_procedure(self) -> ProcDesc {
        self.procedure
    }

    /// Queues the first instruction of the body as a new block following `prev`.
    pub(crate) fn seed(&mut self, prev: NodeId) {
        if let Some(first) = self.instructions.first() {
            self.worklist.push(Pending {
                offset: first.offset,
                prev,
                stack: Vec::new(),
                next_ident: self.next_ident,
                continuation: Continuation::NewBlock,
                finally_exit: None,
            });
        }
    }

    pub(crate) fn next_pending(&mut self) -> Option<Pending> {
        self.worklist.pop()
    }

    /// Restores the path snapshot carried by `pending`.
    pub(crate) fn resume(&mut self, pending: Pending) {
        self.offset = pending.offset;
        self.prev = pending.prev;
        self.next_ident = pending.next_ident;
        self.finally_exit = pending.finally_exit;
        match pending.continuation {
            Continuation::NewBlock => {
                self.current = None;
                self.block_start = pending.offset;
                self.block_stack = pending.stack.clone();
            }
            Continuation::Append(node) => {
                self.current = Some(node);
                self.block_start = pending.offset;
                self.block_stack = pending.stack.clone();
            }
            Continuation::Deferred {
                block_start,
                block_stack,
            } => {
                self.current = None;
                self.block_start = block_start;
                self.block_stack = block_stack;
            }
        }
        self.stack = pending.stack;
    }

    /// Counts a visit of `offset` and returns the total so far.
    pub(crate) fn visit(&mut self, offset: u32) -> usize {
        let visits = self.visits.entry(offset).or_default();
        *visits += 1;
        *visits
    }

    /// Node already built for the current block start, if it may be shared with this path.
    /// Handler offsets are never shared, and the cached operand stack has to match the top of
    /// the current one.
    pub(crate) fn reusable_node(&self) -> Option<NodeId> {
        if self.current.is_some()
            || self.block_start != self.offset
            || self.regions.is_handler_offset(self.offset)
        {
            return None;
        }
        self.node_cache.get(&self.offset)?.iter().find_map(|(node, stack)| {
            self.stack.ends_with(stack).then_some(*node)
        })
    }

    pub(crate) fn link_prev_to(&mut self, node: NodeId) {
        self.procedure.link(self.prev, node);
    }

    pub(crate) fn instruction_at(&self, offset: u32) -> Result<&'a Instruction, TranslateError> {
        let instructions = self.instructions;
        self.index_by_offset
            .get(&offset)
            .map(move |index| &instructions[*index])
            .ok_or(TranslateError::OffsetNotFound(offset))
    }

    /// Offset of the instruction following `offset`.
    pub(crate) fn next_offset(&self, offset: u32) -> Result<u32, TranslateError> {
        let index = self
            .index_by_offset
            .get(&offset)
            .ok_or(TranslateError::OffsetNotFound(offset))?;
        self.instructions
            .get(index + 1)
            .map(|instruction| instruction.offset)
            .ok_or(TranslateError::OffsetNotFound(offset))
    }

    /// Instructions from `offset` to the end of the body.
    pub(crate) fn remaining(&self, offset: u32) -> usize {
        self.index_by_offset
            .get(&offset)
            .map_or(self.instructions.len(), |index| self.instructions.len() - index)
    }

    pub(crate) fn offset(&self) -> u32 {
        self.offset
    }

    pub(crate) fn set_location(&mut self, instruction: &Instruction) {
        if let Some(line) = instruction.line {
            self.location = Location::new(line, &self.source_file);
        }
    }

    pub(crate) fn location(&self) -> Location {
        self.location.clone()
    }

    fn location_of(&self, offset: u32) -> Location {
        self.instruction_at(offset)
            .ok()
            .and_then(|instruction| instruction.line)
            .map_or_else(|| self.location.clone(), |line| Location::new(line, &self.source_file))
    }

    pub(crate) fn push(&mut self, expr: Expr, typ: Typ) {
        self.stack.push(StackValue::new(expr, typ));
    }

    pub(crate) fn push_value(&mut self, value: StackValue) {
        self.stack.push(value);
    }

    pub(crate) fn pop(&mut self) -> Result<StackValue, TranslateError> {
        self.stack
            .pop()
            .ok_or(TranslateError::StackUnderflow { offset: self.offset })
    }

    /// Pops `count` values, returned bottom-most first.
    pub(crate) fn pop_many(&mut self, count: usize) -> Result<Vec<StackValue>, TranslateError> {
        if self.stack.len() < count {
            return Err(TranslateError::StackUnderflow { offset: self.offset });
        }
        Ok(self.stack.split_off(self.stack.len() - count))
    }

    pub(crate) fn peek(&self) -> Result<&StackValue, TranslateError> {
        self.stack
            .last()
            .ok_or(TranslateError::StackUnderflow { offset: self.offset })
    }

    pub(crate) fn clear_stack(&mut self) {
        self.stack.clear();
    }

    pub(crate) fn fresh_ident(&mut self) -> Ident {
        let ident = Ident {
            stamp: self.next_ident,
        };
        self.next_ident += 1;
        ident
    }

    /// Program variable and type of argument `index`; `this` is argument 0 of instance methods.
    pub(crate) fn argument(&self, index: usize) -> Result<(Expr, Typ), TranslateError> {
        if self.method.has_this() {
            if index == 0 {
                return Ok((Expr::lvar(THIS_VAR), Typ::from_type_name(self.declaring_type)));
            }
            return self.parameter(index - 1);
        }
        self.parameter(index)
    }

    fn parameter(&self, index: usize) -> Result<(Expr, Typ), TranslateError> {
        let parameter = self.method.parameters.get(index).ok_or(TranslateError::IndexOutOfRange {
            what: "argument",
            index,
            offset: self.offset,
        })?;
        Ok((
            Expr::lvar(parameter.name.as_str()),
            Typ::from_type_name(&parameter.param_type),
        ))
    }

    pub(crate) fn local(&self, index: usize) -> Result<(Expr, Typ), TranslateError> {
        let local_type = self.locals.get(index).ok_or(TranslateError::IndexOutOfRange {
            what: "local",
            index,
            offset: self.offset,
        })?;
        Ok((Expr::lvar(local_name(index)), Typ::from_type_name(local_type)))
    }

    pub(crate) fn return_var() -> Expr {
        Expr::lvar(RETURN_VAR)
    }

    /// Appends `instr` to the node of the current block, opening one if needed.
    pub(crate) fn emit(&mut self, instr: Instr) -> Result<(), TranslateError> {
        let node = self.open_node(NodeKind::Statement)?;
        self.procedure.node_mut(node).instrs.push(instr);
        Ok(())
    }

    /// Node of the current block; an empty join node when nothing was emitted yet.
    pub(crate) fn current_node(&mut self) -> Result<NodeId, TranslateError> {
        self.open_node(NodeKind::Join)
    }

    fn open_node(&mut self, kind: NodeKind) -> Result<NodeId, TranslateError> {
        if let Some(node) = self.current {
            return Ok(node);
        }
        let node = self.procedure.add_node(kind, self.location.clone());
        self.procedure.node_mut(node).block_end_offset = self.regions.block_end(self.block_start);
        self.procedure.link(self.prev, node);
        self.attach_exception_edge(node, self.offset)?;
        self.node_cache
            .entry(self.block_start)
            .or_default()
            .push((node, self.block_stack.clone()));
        self.current = Some(node);
        Ok(node)
    }

    fn attach_exception_edge(&mut self, node: NodeId, offset: u32) -> Result<(), TranslateError> {
        if let Some(target) = self.regions.exception_target(offset) {
            let entry = self.handler_entry(target)?;
            self.procedure.set_exception_edge(node, entry);
        }
        Ok(())
    }

    /// Node an exception raised on the current path is routed to.
    pub(crate) fn exception_destination(&mut self) -> Result<NodeId, TranslateError> {
        match self.regions.exception_target(self.offset) {
            Some(target) => self.handler_entry(target),
            None => Ok(self.procedure.exn_sink()),
        }
    }

    pub(crate) fn exit_node(&self) -> NodeId {
        self.procedure.exit()
    }

    /// Creates a prune node following `from` and attaches it to the current handler.
    pub(crate) fn prune_node(
        &mut self,
        from: NodeId,
        cond: Expr,
        true_branch: bool,
        if_kind: IfKind,
    ) -> Result<NodeId, TranslateError> {
        let node = self.procedure.add_node(
            NodeKind::Prune {
                true_branch,
                if_kind,
            },
            self.location.clone(),
        );
        self.procedure.node_mut(node).instrs.push(Instr::Prune {
            cond,
            true_branch,
            kind: if_kind,
            loc: self.location.clone(),
        });
        self.procedure.node_mut(node).block_end_offset = self.regions.block_end(self.offset);
        self.procedure.link(from, node);
        self.attach_exception_edge(node, self.offset)?;
        Ok(node)
    }

    /// Continues the current path at the next instruction.
    pub(crate) fn fall_through(&mut self) -> Result<(), TranslateError> {
        let next = self.next_offset(self.offset)?;
        let pending = if self.leaders.contains(&next) {
            let prev = self.current.unwrap_or(self.prev);
            self.snapshot(next, prev, Continuation::NewBlock)
        } else if let Some(node) = self.current {
            self.snapshot(next, node, Continuation::Append(node))
        } else {
            let continuation = Continuation::Deferred {
                block_start: self.block_start,
                block_stack: self.block_stack.clone(),
            };
            self.snapshot(next, self.prev, continuation)
        };
        self.worklist.push(pending);
        Ok(())
    }

    /// Queues `target` as a successor of `from`, keeping the current operand stack.
    pub(crate) fn branch_from(&mut self, from: NodeId, target: u32) {
        let continuation = if self.leaders.contains(&target) {
            Continuation::NewBlock
        } else {
            Continuation::Append(from)
        };
        let pending = self.snapshot(target, from, continuation);
        self.worklist.push(pending);
    }

    /// Unconditional transfer from the current block to `target`.
    pub(crate) fn jump(&mut self, target: u32) -> Result<(), TranslateError> {
        let node = self.current_node()?;
        self.branch_from(node, target);
        Ok(())
    }

    /// Runs the body of finally `index` from the current block, then leaves through `exit`.
    pub(crate) fn enter_finally(&mut self, index: usize, exit: FinallyExit) -> Result<(), TranslateError> {
        let handler_start = self
            .regions
            .finally_region(index)
            .map(|finally| finally.handler_start)
            .ok_or(TranslateError::IndexOutOfRange {
                what: "finally",
                index,
                offset: self.offset,
            })?;
        let node = self.current_node()?;
        let mut pending = self.snapshot(handler_start, node, Continuation::NewBlock);
        pending.stack.clear();
        pending.finally_exit = Some(exit);
        self.worklist.push(pending);
        Ok(())
    }

    pub(crate) fn finally_exit(&self) -> Option<FinallyExit> {
        self.finally_exit
    }

    pub(crate) fn leave_finally(&mut self) {
        self.finally_exit = None;
    }

    fn snapshot(&self, offset: u32, prev: NodeId, continuation: Continuation) -> Pending {
        Pending {
            offset,
            prev,
            stack: self.stack.clone(),
            next_ident: self.next_ident,
            continuation,
            finally_exit: self.finally_exit,
        }
    }

    /// Entry node of a handler, created once per handler offset together with the work for its
    /// body.
    pub(crate) fn handler_entry(&mut self, target: HandlerTarget) -> Result<NodeId, TranslateError> {
        let offset = self.offset;
        let missing = |index| TranslateError::IndexOutOfRange {
            what: "handler",
            index,
            offset,
        };
        match target {
            HandlerTarget::Catch(index) => {
                let clause = self.regions.catch_clause(index).cloned().ok_or(missing(index))?;
                if let Some(entry) = self.handler_entries.get(&clause.handler_start) {
                    return Ok(*entry);
                }
                let loc = self.location_of(clause.handler_start);
                let entry = self.procedure.add_node(NodeKind::ExceptionHandler, loc.clone());
                self.handler_entries.insert(clause.handler_start, entry);

                let object = Typ::from_type_name(OBJECT_TYPE);
                let caught = Typ::from_type_name(&clause.catch_type);
                let exception = self.fresh_ident();
                let unwrapped = self.fresh_ident();
                let test = self.fresh_ident();
                self.procedure.node_mut(entry).instrs.extend([
                    Instr::Load {
                        id: exception,
                        lvalue: Self::return_var(),
                        typ: object.clone(),
                        loc: loc.clone(),
                    },
                    Instr::Store {
                        lvalue: Self::return_var(),
                        value: Expr::null(),
                        typ: object.clone(),
                        loc: loc.clone(),
                    },
                    Instr::Call {
                        ret: unwrapped,
                        ret_typ: object.clone(),
                        callee: Expr::fun(UNWRAP_EXCEPTION),
                        args: vec![CallArg::new(Expr::Var(exception), object.clone())],
                        flags: CallFlags::default(),
                        loc: loc.clone(),
                    },
                    Instr::Call {
                        ret: test,
                        ret_typ: Typ::bool(),
                        callee: Expr::fun(INSTANCEOF),
                        args: vec![
                            CallArg::new(Expr::Var(unwrapped), object.clone()),
                            CallArg::new(
                                Expr::Sizeof(caught.strip_pointer().clone()),
                                Typ::Void,
                            ),
                        ],
                        flags: CallFlags::default(),
                        loc: loc.clone(),
                    },
                ]);

                let previous_location = std::mem::replace(&mut self.location, loc.clone());
                let caught_node =
                    self.synthetic_prune(entry, Expr::Var(test), true, clause.handler_start)?;
                let missed_node = self.synthetic_prune(
                    entry,
                    Expr::not(Expr::Var(test)),
                    false,
                    clause.handler_start,
                )?;
                self.location = previous_location;
                self.procedure.node_mut(missed_node).instrs.push(Instr::Store {
                    lvalue: Self::return_var(),
                    value: Expr::Exn(Box::new(Expr::Var(unwrapped))),
                    typ: object,
                    loc,
                });

                let onward = match (clause.next, clause.finally) {
                    (Some(next), _) => self.handler_entry(HandlerTarget::Catch(next))?,
                    (None, Some(finally)) => self.handler_entry(HandlerTarget::Finally(finally))?,
                    (None, None) => self.procedure.exn_sink(),
                };
                self.procedure.link(missed_node, onward);
                if let Some(finally) = clause.finally {
                    let finally_entry = self.handler_entry(HandlerTarget::Finally(finally))?;
                    for node in [entry, caught_node, missed_node] {
                        self.procedure.set_exception_edge(node, finally_entry);
                    }
                }

                self.worklist.push(Pending {
                    offset: clause.handler_start,
                    prev: caught_node,
                    stack: vec![StackValue::new(Expr::Var(unwrapped), caught)],
                    next_ident: self.next_ident,
                    continuation: Continuation::NewBlock,
                    finally_exit: None,
                });
                Ok(entry)
            }
            HandlerTarget::Finally(index) => {
                let finally = self.regions.finally_region(index).cloned().ok_or(missing(index))?;
                if let Some(entry) = self.handler_entries.get(&finally.handler_start) {
                    return Ok(*entry);
                }
                let loc = self.location_of(finally.handler_start);
                let entry = self.procedure.add_node(NodeKind::ExceptionHandler, loc.clone());
                self.handler_entries.insert(finally.handler_start, entry);

                let object = Typ::from_type_name(OBJECT_TYPE);
                let exception = self.fresh_ident();
                self.procedure.node_mut(entry).instrs.extend([
                    Instr::Load {
                        id: exception,
                        lvalue: Self::return_var(),
                        typ: object.clone(),
                        loc: loc.clone(),
                    },
                    Instr::Store {
                        lvalue: Self::return_var(),
                        value: Expr::null(),
                        typ: object,
                        loc,
                    },
                ]);
                self.worklist.push(Pending {
                    offset: finally.handler_start,
                    prev: entry,
                    stack: Vec::new(),
                    next_ident: self.next_ident,
                    continuation: Continuation::NewBlock,
                    finally_exit: Some(FinallyExit::Rethrow(exception)),
                });
                Ok(entry)
            }
        }
    }

    fn synthetic_prune(
        &mut self,
        from: NodeId,
        cond: Expr,
        true_branch: bool,
        offset: u32,
    ) -> Result<NodeId, TranslateError> {
        let node = self.procedure.add_node(
            NodeKind::Prune {
                true_branch,
                if_kind: IfKind::If,
            },
            self.location.clone(),
        );
        self.procedure.node_mut(node).instrs.push(Instr::Prune {
            cond,
            true_branch,
            kind: IfKind::If,
            loc: self.location.clone(),
        });
        self.procedure.node_mut(node).block_end_offset = self.regions.block_end(offset);
        self.procedure.link(from, node);
        Ok(node)
    }
}

pub(crate) fn local_name(index: usize) -> String {
    format!("V_{index}")
}
