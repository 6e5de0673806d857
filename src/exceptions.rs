use std::collections::BTreeSet;

use log::debug;

use crate::ir::{ExceptionHandler, HandlerKind, Instruction, Opcode};

const DEFAULT_CATCH_TYPE: &str = "System.Exception";

/// Innermost kind of region containing an offset.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum RegionKind {
    TryCatch,
    TryFinally,
    Catch,
    Finally,
    None,
}

/// Handler an exception raised at some offset is routed to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum HandlerTarget {
    Catch(usize),
    Finally(usize),
}

#[derive(Clone, Debug)]
pub(crate) struct CatchClause {
    pub(crate) try_start: u32,
    pub(crate) try_end: u32,
    pub(crate) handler_start: u32,
    pub(crate) handler_end: u32,
    pub(crate) catch_type: String,
    /// Next clause of the same try range, ordered by handler start.
    pub(crate) next: Option<usize>,
    /// Finally wrapping the whole try-catch, in the try-catch-finally shape.
    pub(crate) finally: Option<usize>,
}

#[derive(Clone, Debug)]
pub(crate) struct FinallyRegion {
    pub(crate) try_start: u32,
    pub(crate) try_end: u32,
    pub(crate) handler_start: u32,
    pub(crate) handler_end: u32,
}

/// Protected regions of one method body, indexed for offset lookups.
#[derive(Clone, Debug, Default)]
pub(crate) struct ExceptionRegions {
    catches: Vec<CatchClause>,
    finallies: Vec<FinallyRegion>,
    boundaries: BTreeSet<u32>,
    unhandled: bool,
    valid: bool,
}

impl ExceptionRegions {
    pub(crate) fn analyze(handlers: &[ExceptionHandler], instructions: &[Instruction]) -> Self {
        let mut regions = ExceptionRegions {
            valid: true,
            ..ExceptionRegions::default()
        };

        for handler in handlers {
            let (Some(handler_start), Some(handler_end)) =
                (handler.handler_start, handler.handler_end)
            else {
                regions.unhandled = true;
                continue;
            };
            match handler.kind {
                HandlerKind::Catch => regions.catches.push(CatchClause {
                    try_start: handler.try_start,
                    try_end: handler.try_end,
                    handler_start,
                    handler_end,
                    catch_type: handler
                        .catch_type
                        .clone()
                        .unwrap_or_else(|| DEFAULT_CATCH_TYPE.to_string()),
                    next: None,
                    finally: None,
                }),
                HandlerKind::Finally => regions.finallies.push(FinallyRegion {
                    try_start: handler.try_start,
                    try_end: handler.try_end,
                    handler_start,
                    handler_end,
                }),
                HandlerKind::Filter | HandlerKind::Fault => {
                    regions.unhandled = true;
                    continue;
                }
            }
            regions.boundaries.extend([
                handler.try_start,
                handler.try_end,
                handler_start,
                handler_end,
            ]);
        }

        regions
            .catches
            .sort_by_key(|clause| (clause.try_start, clause.try_end, clause.handler_start));
        regions.link_catch_chains();
        regions.valid = regions.groups_are_disjoint() && !regions.finally_ends_with_throw(instructions);
        if !regions.valid {
            debug!("unsupported exception region layout");
        }
        regions
    }

    fn link_catch_chains(&mut self) {
        for index in 1..self.catches.len() {
            let (previous, current) = (&self.catches[index - 1], &self.catches[index]);
            if previous.try_start == current.try_start && previous.try_end == current.try_end {
                self.catches[index - 1].next = Some(index);
            }
        }
        for index in 0..self.catches.len() {
            let group_end = self.catch_group_end(index);
            let try_start = self.catches[index].try_start;
            self.catches[index].finally = self.finallies.iter().position(|finally| {
                finally.try_start == try_start && finally.try_end >= group_end
            });
        }
    }

    /// Exclusive end of the try-catch group `index` belongs to, handlers included.
    fn catch_group_end(&self, index: usize) -> u32 {
        let clause = &self.catches[index];
        self.catches
            .iter()
            .filter(|other| other.try_start == clause.try_start && other.try_end == clause.try_end)
            .map(|other| other.handler_end.max(other.try_end))
            .max()
            .unwrap_or(clause.handler_end)
    }

    /// Groups of regions may only overlap in the try-catch-finally shape.
    fn groups_are_disjoint(&self) -> bool {
        let mut groups = BTreeSet::new();
        let mut spans: Vec<(u32, u32, Option<usize>)> = Vec::new();
        for (index, clause) in self.catches.iter().enumerate() {
            if groups.insert((clause.try_start, clause.try_end)) {
                spans.push((clause.try_start, self.catch_group_end(index), None));
            }
        }
        let catch_spans = spans.len();
        for (index, finally) in self.finallies.iter().enumerate() {
            spans.push((finally.try_start, finally.handler_end.max(finally.try_end), Some(index)));
        }

        for (left_index, left) in spans.iter().enumerate() {
            for right in spans.iter().skip(left_index + 1) {
                let overlaps = left.0 < right.1 && right.0 < left.1;
                if !overlaps {
                    continue;
                }
                let wraps_catch = match (left.2, right.2, left_index < catch_spans) {
                    (None, Some(finally), true) => self
                        .catches
                        .iter()
                        .any(|clause| clause.try_start == left.0 && clause.finally == Some(finally)),
                    _ => false,
                };
                if !wraps_catch {
                    return false;
                }
            }
        }
        true
    }

    fn finally_ends_with_throw(&self, instructions: &[Instruction]) -> bool {
        self.finallies.iter().any(|finally| {
            instructions
                .iter()
                .filter(|instruction| {
                    instruction.offset >= finally.handler_start
                        && instruction.offset < finally.handler_end
                })
                .next_back()
                .is_some_and(|last| last.opcode() == Opcode::Throw)
        })
    }

    /// Whether the method has a handler this translator cannot express (filter, fault, or
    /// a handler range missing from the metadata).
    pub(crate) fn unhandled(&self) -> bool {
        self.unhandled
    }

    /// Whether the region layout is one the translator supports.
    pub(crate) fn valid(&self) -> bool {
        self.valid
    }

    pub(crate) fn boundaries(&self) -> impl Iterator<Item = u32> + '_ {
        self.boundaries.iter().copied()
    }

    pub(crate) fn catch_clause(&self, index: usize) -> Option<&CatchClause> {
        self.catches.get(index)
    }

    pub(crate) fn finally_region(&self, index: usize) -> Option<&FinallyRegion> {
        self.finallies.get(index)
    }

    /// Narrowest region containing `offset`.
    pub(crate) fn region_at(&self, offset: u32) -> RegionKind {
        self.innermost(offset).map_or(RegionKind::None, |(kind, _, _)| kind)
    }

    /// Returns the region kind, its index and its exclusive end.
    fn innermost(&self, offset: u32) -> Option<(RegionKind, usize, u32)> {
        let mut best: Option<(RegionKind, usize, u32, u32)> = None;
        let mut consider = |kind: RegionKind, index: usize, start: u32, end: u32| {
            if offset < start || offset >= end {
                return;
            }
            let width = end - start;
            if best.is_none_or(|(_, _, _, best_width)| width < best_width) {
                best = Some((kind, index, end, width));
            }
        };
        for (index, clause) in self.catches.iter().enumerate() {
            consider(RegionKind::TryCatch, index, clause.try_start, clause.try_end);
        }
        for (index, finally) in self.finallies.iter().enumerate() {
            consider(RegionKind::TryFinally, index, finally.try_start, finally.try_end);
        }
        for (index, clause) in self.catches.iter().enumerate() {
            consider(RegionKind::Catch, index, clause.handler_start, clause.handler_end);
        }
        for (index, finally) in self.finallies.iter().enumerate() {
            consider(RegionKind::Finally, index, finally.handler_start, finally.handler_end);
        }
        best.map(|(kind, index, end, _)| (kind, index, end))
    }

    /// Handler receiving exceptions raised at `offset`; `None` means the exception sink.
    pub(crate) fn exception_target(&self, offset: u32) -> Option<HandlerTarget> {
        match self.innermost(offset)? {
            (RegionKind::TryCatch, index, _) => Some(HandlerTarget::Catch(self.chain_head(index))),
            (RegionKind::TryFinally, index, _) => Some(HandlerTarget::Finally(index)),
            (RegionKind::Catch, index, _) => self.catches[index].finally.map(HandlerTarget::Finally),
            _ => None,
        }
    }

    fn chain_head(&self, index: usize) -> usize {
        let clause = &self.catches[index];
        self.catches
            .iter()
            .position(|other| other.try_start == clause.try_start && other.try_end == clause.try_end)
            .unwrap_or(index)
    }

    /// Finally a `leave` at `offset` jumping to `target` has to run first.
    pub(crate) fn finally_for_leave(&self, offset: u32, target: u32) -> Option<usize> {
        let in_catch_of = |index: usize| {
            self.catches.iter().any(|clause| {
                clause.finally == Some(index)
                    && offset >= clause.handler_start
                    && offset < clause.handler_end
            })
        };
        self.finallies
            .iter()
            .enumerate()
            .filter(|(index, finally)| {
                let protects = (offset >= finally.try_start && offset < finally.try_end)
                    || in_catch_of(*index);
                let leaves = target < finally.try_start || target >= finally.try_end;
                protects && leaves
            })
            .min_by_key(|(_, finally)| finally.try_end - finally.try_start)
            .map(|(index, _)| index)
    }

    /// Exclusive end offset of the innermost region containing `offset`.
    pub(crate) fn block_end(&self, offset: u32) -> Option<u32> {
        self.innermost(offset).map(|(_, _, end)| end)
    }

    /// Offsets inside catch or finally handlers, where nodes are never reused.
    pub(crate) fn is_handler_offset(&self, offset: u32) -> bool {
        matches!(self.region_at(offset), RegionKind::Catch | RegionKind::Finally)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Operand;

    fn instruction(offset: u32, opcode: &str) -> Instruction {
        Instruction {
            offset,
            opcode: opcode.to_string(),
            operand: Operand::None,
            line: Some(1),
        }
    }

    fn handler(kind: HandlerKind, try_range: (u32, u32), handler_range: (u32, u32)) -> ExceptionHandler {
        ExceptionHandler {
            kind,
            try_start: try_range.0,
            try_end: try_range.1,
            handler_start: Some(handler_range.0),
            handler_end: Some(handler_range.1),
            catch_type: (kind == HandlerKind::Catch).then(|| "System.IO.IOException".to_string()),
        }
    }

    fn body(opcodes: &[&str]) -> Vec<Instruction> {
        opcodes
            .iter()
            .enumerate()
            .map(|(index, opcode)| instruction(index as u32, opcode))
            .collect()
    }

    #[test]
    fn try_catch_finally_routes_catch_to_finally() {
        let instructions = body(&[
            "nop", "leave", "pop", "leave", "pop", "leave", "nop", "endfinally", "ret",
        ]);
        let handlers = vec![
            handler(HandlerKind::Catch, (0, 2), (2, 4)),
            handler(HandlerKind::Catch, (0, 2), (4, 6)),
            handler(HandlerKind::Finally, (0, 6), (6, 8)),
        ];

        let regions = ExceptionRegions::analyze(&handlers, &instructions);

        assert!(regions.valid());
        assert!(!regions.unhandled());
        assert_eq!(regions.region_at(0), RegionKind::TryCatch);
        assert_eq!(regions.region_at(3), RegionKind::Catch);
        assert_eq!(regions.region_at(7), RegionKind::Finally);
        assert_eq!(regions.region_at(8), RegionKind::None);
        assert_eq!(regions.exception_target(0), Some(HandlerTarget::Catch(0)));
        assert_eq!(regions.exception_target(4), Some(HandlerTarget::Finally(0)));
        assert_eq!(regions.exception_target(7), None);
        assert_eq!(regions.catch_clause(0).and_then(|clause| clause.next), Some(1));
        assert_eq!(regions.finally_for_leave(3, 8), Some(0));
        assert_eq!(regions.block_end(1), Some(2));
        assert!(regions.is_handler_offset(2));
        assert!(!regions.is_handler_offset(1));
    }

    #[test]
    fn nested_try_catch_is_invalid() {
        let instructions = body(&["nop", "nop", "leave", "pop", "leave", "pop", "leave", "ret"]);
        let handlers = vec![
            handler(HandlerKind::Catch, (1, 3), (3, 5)),
            handler(HandlerKind::Catch, (0, 5), (5, 7)),
        ];

        let regions = ExceptionRegions::analyze(&handlers, &instructions);

        assert!(!regions.valid());
    }

    #[test]
    fn finally_ending_with_throw_is_invalid() {
        let instructions = body(&["nop", "leave", "ldnull", "throw", "ret"]);
        let handlers = vec![handler(HandlerKind::Finally, (0, 2), (2, 4))];

        let regions = ExceptionRegions::analyze(&handlers, &instructions);

        assert!(!regions.valid());
    }

    #[test]
    fn filter_handler_is_unhandled() {
        let instructions = body(&["nop", "leave", "pop", "leave", "ret"]);
        let handlers = vec![handler(HandlerKind::Filter, (0, 2), (2, 4))];

        let regions = ExceptionRegions::analyze(&handlers, &instructions);

        assert!(regions.unhandled());
        assert!(regions.valid());
    }
}
