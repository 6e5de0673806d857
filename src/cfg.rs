use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use serde::Deserialize;
use serde_json::{Value, json};

use crate::ir::Instruction;
use crate::sil::instr::{IfKind, Instr, Location};
use crate::sil::types::Typ;

/// Index of a node inside its procedure's arena.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub(crate) struct NodeId(pub(crate) usize);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum NodeKind {
    Start,
    Exit,
    ExceptionSink,
    Statement,
    Prune { true_branch: bool, if_kind: IfKind },
    Join,
    ExceptionHandler,
}

impl NodeKind {
    fn label(self) -> String {
        match self {
            NodeKind::Start => "Start".to_string(),
            NodeKind::Exit => "Exit".to_string(),
            NodeKind::ExceptionSink => "exception sink".to_string(),
            NodeKind::Statement => "Stmt".to_string(),
            NodeKind::Prune {
                true_branch,
                if_kind,
            } => format!("Prune ({true_branch} branch, {})", if_kind.as_str()),
            NodeKind::Join => "Join".to_string(),
            NodeKind::ExceptionHandler => "exception handler".to_string(),
        }
    }
}

/// Basic block of SIL instructions with its normal and exceptional edges.
#[derive(Clone, Debug)]
pub(crate) struct CfgNode {
    /// Id unique across the whole CFG.
    pub(crate) id: u64,
    pub(crate) kind: NodeKind,
    pub(crate) location: Location,
    pub(crate) block_end_offset: Option<u32>,
    pub(crate) instrs: Vec<Instr>,
    pub(crate) succs: Vec<NodeId>,
    pub(crate) preds: Vec<NodeId>,
    pub(crate) exn: Vec<NodeId>,
    pub(crate) exn_preds: Vec<NodeId>,
}

/// Signature-level data of a translated method.
#[derive(Clone, Debug)]
pub(crate) struct ProcAttributes {
    pub(crate) name: String,
    pub(crate) formals: Vec<(String, Typ)>,
    pub(crate) locals: Vec<(String, Typ)>,
    pub(crate) ret_type: Typ,
    pub(crate) loc: Location,
}

/// Control-flow graph of one method.
#[derive(Clone, Debug)]
pub(crate) struct ProcDesc {
    pub(crate) pd_id: u64,
    pub(crate) attributes: ProcAttributes,
    nodes: Vec<CfgNode>,
    start: NodeId,
    exit: NodeId,
    exn_sink: NodeId,
    next_node_id: u64,
}

impl ProcDesc {
    fn new(pd_id: u64, attributes: ProcAttributes, first_node_id: u64) -> Self {
        let mut procedure = ProcDesc {
            pd_id,
            nodes: Vec::new(),
            start: NodeId(0),
            exit: NodeId(0),
            exn_sink: NodeId(0),
            next_node_id: first_node_id,
            attributes,
        };
        let loc = procedure.attributes.loc.clone();
        procedure.start = procedure.add_node(NodeKind::Start, loc.clone());
        procedure.exit = procedure.add_node(NodeKind::Exit, loc.clone());
        procedure.exn_sink = procedure.add_node(NodeKind::ExceptionSink, loc);
        procedure
    }

    pub(crate) fn name(&self) -> &str {
        &self.attributes.name
    }

    pub(crate) fn start(&self) -> NodeId {
        self.start
    }

    pub(crate) fn exit(&self) -> NodeId {
        self.exit
    }

    pub(crate) fn exn_sink(&self) -> NodeId {
        self.exn_sink
    }

    #[cfg(test)]
    pub(crate) fn nodes(&self) -> &[CfgNode] {
        &self.nodes
    }

    #[cfg(test)]
    pub(crate) fn node(&self, id: NodeId) -> &CfgNode {
        &self.nodes[id.0]
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut CfgNode {
        &mut self.nodes[id.0]
    }

    pub(crate) fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len()).map(NodeId)
    }

    pub(crate) fn add_node(&mut self, kind: NodeKind, location: Location) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(CfgNode {
            id: self.next_node_id,
            kind,
            location,
            block_end_offset: None,
            instrs: Vec::new(),
            succs: Vec::new(),
            preds: Vec::new(),
            exn: Vec::new(),
            exn_preds: Vec::new(),
        });
        self.next_node_id += 1;
        id
    }

    /// Adds a normal edge; repeated edges are ignored.
    pub(crate) fn link(&mut self, from: NodeId, to: NodeId) {
        let succs = &mut self.nodes[from.0].succs;
        if !succs.contains(&to) {
            succs.push(to);
        }
    }

    pub(crate) fn set_exception_edge(&mut self, from: NodeId, to: NodeId) {
        self.nodes[from.0].exn = vec![to];
    }

    /// Completes exceptional routing and derives predecessor sets.
    pub(crate) fn finalize(&mut self) {
        let (start, exit, sink) = (self.start, self.exit, self.exn_sink);
        for (index, node) in self.nodes.iter_mut().enumerate() {
            let id = NodeId(index);
            if id != start && id != exit && id != sink && node.exn.is_empty() {
                node.exn = vec![sink];
            }
        }
        self.nodes[start.0].exn = vec![exit];
        self.nodes[sink.0].exn = vec![exit];
        self.nodes[exit.0].exn.clear();
        self.link(sink, exit);
        self.compute_predecessors();
    }

    /// Breadth-first from the start node over both edge kinds; nodes not reached that way
    /// are visited afterwards in arena order so every edge has its reverse.
    fn compute_predecessors(&mut self) {
        for node in &mut self.nodes {
            node.preds.clear();
            node.exn_preds.clear();
        }

        let mut order = Vec::with_capacity(self.nodes.len());
        let mut seen = vec![false; self.nodes.len()];
        let mut queue = VecDeque::from([self.start]);
        seen[self.start.0] = true;
        while let Some(id) = queue.pop_front() {
            order.push(id);
            let node = &self.nodes[id.0];
            for next in node.succs.iter().chain(node.exn.iter()) {
                if !seen[next.0] {
                    seen[next.0] = true;
                    queue.push_back(*next);
                }
            }
        }
        order.extend(self.node_ids().filter(|id| !seen[id.0]).collect::<Vec<_>>());

        for id in order {
            let (succs, exn) = {
                let node = &self.nodes[id.0];
                (node.succs.clone(), node.exn.clone())
            };
            for succ in succs {
                self.nodes[succ.0].preds.push(id);
            }
            for handler in exn {
                self.nodes[handler.0].exn_preds.push(id);
            }
        }
    }

    fn render_node(&self, f: &mut fmt::Formatter<'_>, node: &CfgNode) -> fmt::Result {
        let ids = |edges: &[NodeId]| -> Vec<u64> {
            edges.iter().map(|edge| self.nodes[edge.0].id).collect()
        };
        write_node(
            f,
            node.id,
            [&ids(&node.preds), &ids(&node.succs), &ids(&node.exn)],
            &node.kind.label(),
            node.instrs.iter(),
        )
    }

    fn to_json(&self) -> Value {
        let ids = |edges: &[NodeId]| -> Vec<u64> {
            edges.iter().map(|edge| self.nodes[edge.0].id).collect()
        };
        let nodes: Vec<Value> = self
            .nodes
            .iter()
            .map(|node| {
                json!({
                    "nd_id": node.id,
                    "nd_kind": node.kind.label(),
                    "nd_loc": {
                        "line": node.location.line,
                        "col": node.location.col,
                        "file": node.location.file,
                    },
                    "nd_block_end_offset": node.block_end_offset,
                    "nd_instrs": node.instrs.iter().map(|instr| json!({
                        "kind": instr.kind(),
                        "text": instr.to_string(),
                    })).collect::<Vec<_>>(),
                    "nd_succ_ids": ids(&node.succs),
                    "nd_pred_ids": ids(&node.preds),
                    "nd_exn_ids": ids(&node.exn),
                    "nd_exn_pred_ids": ids(&node.exn_preds),
                })
            })
            .collect();
        json!({
            "pd_id": self.pd_id,
            "pd_attributes": {
                "name": self.attributes.name,
                "formals": self.attributes.formals.iter()
                    .map(|(name, typ)| json!({"name": name, "type": typ}))
                    .collect::<Vec<_>>(),
                "locals": self.attributes.locals.iter()
                    .map(|(name, typ)| json!({"name": name, "type": typ}))
                    .collect::<Vec<_>>(),
                "ret_type": self.attributes.ret_type,
                "loc": {
                    "line": self.attributes.loc.line,
                    "file": self.attributes.loc.file,
                },
            },
            "pd_nodes": nodes,
            "pd_start_node": self.nodes[self.start.0].id,
            "pd_exit_node": self.nodes[self.exit.0].id,
            "pd_exn_node": self.nodes[self.exn_sink.0].id,
        })
    }
}

impl fmt::Display for ProcDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "procedure {} (pd {})", self.attributes.name, self.pd_id)?;
        for node in &self.nodes {
            self.render_node(f, node)?;
        }
        Ok(())
    }
}

/// Procedures keyed by fully qualified method name, sharing one node-id space.
#[derive(Debug, Default)]
pub(crate) struct Cfg {
    procs: BTreeMap<String, ProcDesc>,
    next_node_id: u64,
    next_proc_id: u64,
}

impl Cfg {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Starts a procedure whose ids only become reserved once it is committed.
    pub(crate) fn begin_procedure(&self, attributes: ProcAttributes) -> ProcDesc {
        ProcDesc::new(self.next_proc_id, attributes, self.next_node_id)
    }

    pub(crate) fn commit(&mut self, procedure: ProcDesc) {
        self.next_node_id = procedure.next_node_id;
        self.next_proc_id = procedure.pd_id + 1;
        self.procs.insert(procedure.name().to_string(), procedure);
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    #[cfg(test)]
    pub(crate) fn get(&self, name: &str) -> Option<&ProcDesc> {
        self.procs.get(name)
    }

    pub(crate) fn len(&self) -> usize {
        self.procs.len()
    }

    pub(crate) fn node_count(&self) -> usize {
        self.procs.values().map(|procedure| procedure.nodes.len()).sum()
    }

    #[cfg(test)]
    pub(crate) fn next_node_id(&self) -> u64 {
        self.next_node_id
    }

    pub(crate) fn to_json(&self) -> Value {
        let procs: serde_json::Map<String, Value> = self
            .procs
            .iter()
            .map(|(name, procedure)| (name.clone(), procedure.to_json()))
            .collect();
        json!({ "procs": procs })
    }

    /// Graphviz export: one cluster per procedure, exceptional edges dashed.
    pub(crate) fn to_dot(&self) -> String {
        let mut out = String::from("digraph cfg {\n");
        for (index, procedure) in self.procs.values().enumerate() {
            out.push_str(&format!("  subgraph cluster_{index} {{\n"));
            out.push_str(&format!("    label={:?};\n", procedure.name()));
            for node in &procedure.nodes {
                out.push_str(&format!(
                    "    n{} [label={:?}];\n",
                    node.id,
                    format!("{} {}", node.id, node.kind.label())
                ));
            }
            for node in &procedure.nodes {
                for succ in &node.succs {
                    out.push_str(&format!(
                        "    n{} -> n{};\n",
                        node.id, procedure.nodes[succ.0].id
                    ));
                }
                for handler in &node.exn {
                    out.push_str(&format!(
                        "    n{} -> n{} [style=dashed];\n",
                        node.id, procedure.nodes[handler.0].id
                    ));
                }
            }
            out.push_str("  }\n");
        }
        out.push_str("}\n");
        out
    }
}

impl fmt::Display for Cfg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for procedure in self.procs.values() {
            writeln!(f, "{procedure}")?;
        }
        Ok(())
    }
}

/// One node line (`nodeN preds: .. succs: .. exn: .. Kind`) followed by its instructions.
fn write_node<I>(
    f: &mut fmt::Formatter<'_>,
    id: u64,
    [preds, succs, exn]: [&[u64]; 3],
    label: &str,
    instrs: I,
) -> fmt::Result
where
    I: Iterator,
    I::Item: fmt::Display,
{
    let join = |ids: &[u64]| ids.iter().map(u64::to_string).collect::<Vec<_>>().join(" ");
    writeln!(
        f,
        "  node{id} preds: {} succs: {} exn: {} {label}",
        join(preds),
        join(succs),
        join(exn)
    )?;
    for instr in instrs {
        writeln!(f, "    {instr}")?;
    }
    Ok(())
}

/// A CFG read back from the output of [`Cfg::to_json`]; keeps what the text rendering needs.
#[derive(Debug, Deserialize)]
pub(crate) struct SavedCfg {
    procs: BTreeMap<String, SavedProcedure>,
}

impl SavedCfg {
    /// Procedures in name order, restricted to `names` unless it is empty.
    pub(crate) fn select(&self, names: &[String]) -> Vec<&SavedProcedure> {
        self.procs
            .iter()
            .filter(|(name, _)| names.is_empty() || names.contains(*name))
            .map(|(_, procedure)| procedure)
            .collect()
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct SavedProcedure {
    pd_id: u64,
    pd_attributes: SavedAttributes,
    pd_nodes: Vec<SavedNode>,
}

#[derive(Debug, Deserialize)]
struct SavedAttributes {
    name: String,
}

#[derive(Debug, Deserialize)]
struct SavedNode {
    nd_id: u64,
    nd_kind: String,
    #[serde(default)]
    nd_instrs: Vec<SavedInstr>,
    #[serde(default)]
    nd_succ_ids: Vec<u64>,
    #[serde(default)]
    nd_pred_ids: Vec<u64>,
    #[serde(default)]
    nd_exn_ids: Vec<u64>,
}

#[derive(Debug, Deserialize)]
struct SavedInstr {
    text: String,
}

impl fmt::Display for SavedProcedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "procedure {} (pd {})", self.pd_attributes.name, self.pd_id)?;
        for node in &self.pd_nodes {
            write_node(
                f,
                node.nd_id,
                [&node.nd_pred_ids, &node.nd_succ_ids, &node.nd_exn_ids],
                &node.nd_kind,
                node.nd_instrs.iter().map(|instr| &instr.text),
            )?;
        }
        Ok(())
    }
}

/// Offsets where a new node has to start: region boundaries and offsets with more than one
/// static incoming edge. Method entry counts as an incoming edge of the first instruction.
pub(crate) fn block_leaders(
    instructions: &[Instruction],
    boundaries: impl Iterator<Item = u32>,
) -> BTreeSet<u32> {
    let mut incoming: BTreeMap<u32, usize> = BTreeMap::new();
    if let Some(first) = instructions.first() {
        incoming.insert(first.offset, 1);
    }
    for (index, instruction) in instructions.iter().enumerate() {
        if instruction.falls_through() {
            if let Some(next) = instructions.get(index + 1) {
                *incoming.entry(next.offset).or_default() += 1;
            }
        }
        for target in instruction.branch_targets() {
            *incoming.entry(target).or_default() += 1;
        }
    }

    let mut leaders: BTreeSet<u32> = incoming
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(offset, _)| offset)
        .collect();
    leaders.extend(boundaries);
    leaders
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Operand;

    fn attributes(name: &str) -> ProcAttributes {
        ProcAttributes {
            name: name.to_string(),
            formals: Vec::new(),
            locals: Vec::new(),
            ret_type: Typ::Void,
            loc: Location::new(1, "Sample.cs"),
        }
    }

    fn instruction(offset: u32, opcode: &str, operand: Operand) -> Instruction {
        Instruction {
            offset,
            opcode: opcode.to_string(),
            operand,
            line: Some(1),
        }
    }

    #[test]
    fn finalize_routes_exceptions_and_derives_predecessors() {
        let cfg = Cfg::new();
        let mut procedure = cfg.begin_procedure(attributes("System.Void App::Run()"));
        let body = procedure.add_node(NodeKind::Statement, Location::new(2, "Sample.cs"));
        let start = procedure.start();
        let exit = procedure.exit();
        procedure.link(start, body);
        procedure.link(body, exit);
        procedure.link(body, exit);

        procedure.finalize();

        assert_eq!(procedure.node(body).exn, vec![procedure.exn_sink()]);
        assert_eq!(procedure.node(start).exn, vec![exit]);
        assert!(procedure.node(exit).exn.is_empty());
        assert_eq!(procedure.node(body).succs, vec![exit]);
        assert_eq!(procedure.node(exit).preds.len(), 2);
        assert_eq!(procedure.node(procedure.exn_sink()).exn_preds, vec![body]);
    }

    #[test]
    fn committed_procedures_reserve_node_ids() {
        let mut cfg = Cfg::new();
        let abandoned = cfg.begin_procedure(attributes("System.Void App::Skip()"));
        assert_eq!(abandoned.nodes().len(), 3);
        drop(abandoned);
        assert_eq!(cfg.next_node_id(), 0);

        let mut procedure = cfg.begin_procedure(attributes("System.Void App::Run()"));
        procedure.finalize();
        cfg.commit(procedure);

        assert_eq!(cfg.next_node_id(), 3);
        let next = cfg.begin_procedure(attributes("System.Void App::Next()"));
        assert_eq!(next.node(next.start()).id, 3);
        assert_eq!(next.pd_id, 1);
        assert!(cfg.contains("System.Void App::Run()"));
    }

    #[test]
    fn renderings_cover_every_edge_kind() {
        let mut cfg = Cfg::new();
        let mut procedure = cfg.begin_procedure(attributes("System.Void App::Run()"));
        let (start, exit) = (procedure.start(), procedure.exit());
        procedure.link(start, exit);
        procedure.finalize();
        cfg.commit(procedure);

        let dot = cfg.to_dot();
        assert!(dot.contains("n0 -> n1;"));
        assert!(dot.contains("n2 -> n1 [style=dashed];"));

        let json = cfg.to_json();
        let rendered = &json["procs"]["System.Void App::Run()"];
        assert_eq!(rendered["pd_start_node"], 0);
        assert_eq!(rendered["pd_nodes"][1]["nd_pred_ids"], json!([0, 2]));

        assert!(cfg.to_string().contains("node0 preds:  succs: 1 exn: 1 Start"));
    }

    #[test]
    fn saved_cfg_renders_like_the_procedure() {
        let mut cfg = Cfg::new();
        for name in ["System.Void App::Run()", "System.Void App::Stop()"] {
            let mut procedure = cfg.begin_procedure(attributes(name));
            let body = procedure.add_node(NodeKind::Statement, Location::new(2, "Sample.cs"));
            procedure.node_mut(body).instrs.push(Instr::Store {
                lvalue: crate::sil::expr::Expr::lvar("x"),
                value: crate::sil::expr::Expr::int(1),
                typ: Typ::int(),
                loc: Location::new(2, "Sample.cs"),
            });
            let (start, exit) = (procedure.start(), procedure.exit());
            procedure.link(start, body);
            procedure.link(body, exit);
            procedure.finalize();
            cfg.commit(procedure);
        }

        let saved: SavedCfg = serde_json::from_value(cfg.to_json()).expect("saved cfg");
        let selected = saved.select(&["System.Void App::Stop()".to_string()]);

        assert_eq!(selected.len(), 1);
        let expected = cfg.get("System.Void App::Stop()").expect("stop").to_string();
        assert_eq!(selected[0].to_string(), expected);
        assert!(expected.contains("    *&x:int=1 [line 2]\n"));
        assert_eq!(saved.select(&[]).len(), 2);
    }

    #[test]
    fn block_leaders_mark_joins_and_loop_heads() {
        let instructions = vec![
            instruction(0, "ldarg.0", Operand::None),
            instruction(1, "brfalse.s", Operand::Target(4)),
            instruction(3, "br.s", Operand::Target(0)),
            instruction(4, "ret", Operand::None),
        ];

        let leaders = block_leaders(&instructions, std::iter::empty());

        assert_eq!(leaders.into_iter().collect::<Vec<_>>(), vec![0]);
        let with_regions = block_leaders(&instructions, [3u32, 4].into_iter());
        assert!(with_regions.contains(&3));
    }
}
