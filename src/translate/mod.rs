//! Worklist-driven translation of method bodies into procedure CFGs.

use std::collections::BTreeSet;
use std::fmt;

use log::{debug, warn};

use crate::cfg::{Cfg, NodeId, NodeKind, ProcAttributes, ProcDesc};
use crate::ir::{Assembly, FieldRef, MethodBody, MethodDef, TypeDef};
use crate::report::{TranslationLog, UNHANDLED_EXCEPTION};
use crate::rules::RuleSet;
use crate::rules::field::field_address;
use crate::sil::expr::{Expr, THIS_VAR};
use crate::sil::instr::{Instr, Location};
use crate::sil::types::Typ;

pub(crate) mod state;

use state::{TranslationState, local_name};

const BOOLEAN_TYPE: &str = "System.Boolean";

/// Bounds on the work spent translating one method.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct TranslatorConfig {
    /// Translations of a single offset before the method counts as timed out.
    pub(crate) max_offset_visits: usize,
    /// Worklist entries processed before the method counts as timed out.
    pub(crate) max_iterations: usize,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            max_offset_visits: 1000,
            max_iterations: 100_000,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum AbandonReason {
    UnsupportedExceptionRegion,
    UnhandledExceptionRegion,
    Timeout,
    UnknownInstruction(String),
    Internal(String),
}

impl fmt::Display for AbandonReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbandonReason::UnsupportedExceptionRegion => {
                f.write_str("unsupported exception region layout")
            }
            AbandonReason::UnhandledExceptionRegion => f.write_str("unhandled exception region"),
            AbandonReason::Timeout => f.write_str("timed out"),
            AbandonReason::UnknownInstruction(mnemonic) => {
                write!(f, "unknown instruction {mnemonic}")
            }
            AbandonReason::Internal(message) => write!(f, "internal error: {message}"),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Outcome {
    Translated,
    Abandoned {
        reason: AbandonReason,
        /// Instructions left untranslated.
        remaining: usize,
    },
}

/// Result of translating one method. The procedure is finalized only when it is meant to be
/// committed.
pub(crate) struct Translation {
    pub(crate) outcome: Outcome,
    pub(crate) procedure: ProcDesc,
    pub(crate) commit: bool,
}

pub(crate) fn translate_method(
    cfg: &Cfg,
    declaring: &TypeDef,
    method: &MethodDef,
    body: &MethodBody,
    rules: &RuleSet,
    config: &TranslatorConfig,
) -> Translation {
    let name = method.full_name(&declaring.name);
    let procedure = cfg.begin_procedure(attributes(&name, declaring, method, body));
    let mut state = TranslationState::new(&declaring.name, method, body, procedure);

    let entry = constructor_prologue(&mut state, declaring, method);
    state.seed(entry);
    let outcome = run_worklist(&mut state, body, rules, config);

    let commit = match &outcome {
        Outcome::Translated => true,
        Outcome::Abandoned { .. } => method.is_dispose(),
    };
    let mut procedure = state.into_procedure();
    if commit {
        procedure.finalize();
    }
    Translation {
        outcome,
        procedure,
        commit,
    }
}

fn run_worklist(
    state: &mut TranslationState<'_>,
    body: &MethodBody,
    rules: &RuleSet,
    config: &TranslatorConfig,
) -> Outcome {
    let mut iterations = 0usize;
    while let Some(pending) = state.next_pending() {
        iterations += 1;
        let offset = pending.offset;
        state.resume(pending);
        let visits = state.visit(offset);

        if let Some(node) = state.reusable_node() {
            state.link_prev_to(node);
            continue;
        }

        let remaining = state.remaining(offset);
        let reason = if !state.regions().valid() {
            Some(AbandonReason::UnsupportedExceptionRegion)
        } else if state.regions().unhandled() {
            Some(AbandonReason::UnhandledExceptionRegion)
        } else if visits > config.max_offset_visits || iterations > config.max_iterations {
            Some(AbandonReason::Timeout)
        } else {
            None
        };
        if let Some(reason) = reason {
            return Outcome::Abandoned { reason, remaining };
        }

        let instruction = match state.instruction_at(offset) {
            Ok(instruction) => instruction,
            Err(error) => {
                return Outcome::Abandoned {
                    reason: AbandonReason::Internal(error.to_string()),
                    remaining: body.instructions.len(),
                };
            }
        };
        state.set_location(instruction);
        match rules.translate(instruction, state) {
            Ok(true) => {}
            Ok(false) => {
                return Outcome::Abandoned {
                    reason: AbandonReason::UnknownInstruction(instruction.opcode.clone()),
                    remaining,
                };
            }
            Err(error) => {
                return Outcome::Abandoned {
                    reason: AbandonReason::Internal(error.to_string()),
                    remaining: body.instructions.len(),
                };
            }
        }
    }
    Outcome::Translated
}

fn attributes(name: &str, declaring: &TypeDef, method: &MethodDef, body: &MethodBody) -> ProcAttributes {
    let file = method.source_file.clone().unwrap_or_default();
    let mut formals = Vec::new();
    if method.has_this() {
        formals.push((THIS_VAR.to_string(), Typ::from_type_name(&declaring.name)));
    }
    formals.extend(
        method
            .parameters
            .iter()
            .map(|parameter| (parameter.name.clone(), Typ::from_type_name(&parameter.param_type))),
    );
    let locals = body
        .locals
        .iter()
        .enumerate()
        .map(|(index, local)| (local_name(index), Typ::from_type_name(local)))
        .collect();
    let loc = match method.first_line() {
        Some(line) => Location::new(line, &file),
        None => Location::unknown(&file),
    };
    ProcAttributes {
        name: name.to_string(),
        formals,
        locals,
        ret_type: Typ::from_type_name(&method.return_type),
        loc,
    }
}

/// Constructors start by clearing the declaring type's boolean instance fields, so flags read
/// before assignment are known to be false.
fn constructor_prologue(state: &mut TranslationState<'_>, declaring: &TypeDef, method: &MethodDef) -> NodeId {
    let start = state.procedure_mut().start();
    let flags: Vec<_> = declaring
        .fields
        .iter()
        .filter(|field| !field.is_static && field.field_type == BOOLEAN_TYPE)
        .collect();
    if !method.is_constructor() || flags.is_empty() {
        return start;
    }

    let loc = state.location();
    let this_type = Typ::from_type_name(&declaring.name);
    let this = state.fresh_ident();
    let mut instrs = vec![Instr::Load {
        id: this,
        lvalue: Expr::lvar(THIS_VAR),
        typ: this_type,
        loc: loc.clone(),
    }];
    for field in flags {
        let field = FieldRef {
            declaring_type: declaring.name.clone(),
            name: field.name.clone(),
            field_type: field.field_type.clone(),
        };
        instrs.push(Instr::Store {
            lvalue: field_address(Expr::Var(this), &field),
            value: Expr::int(0),
            typ: Typ::bool(),
            loc: loc.clone(),
        });
    }

    let procedure = state.procedure_mut();
    let node = procedure.add_node(NodeKind::Statement, loc);
    procedure.node_mut(node).instrs = instrs;
    procedure.link(start, node);
    node
}

/// Translates every method with a body, committing successful procedures into one CFG.
pub(crate) fn build_cfg(
    assemblies: &[Assembly],
    rules: &RuleSet,
    config: &TranslatorConfig,
) -> (Cfg, TranslationLog) {
    let mut cfg = Cfg::new();
    let mut log = TranslationLog::default();
    let mut seen = BTreeSet::new();

    for assembly in assemblies {
        let assembly_log = translate_assembly(&mut cfg, &mut seen, assembly, rules, config);
        debug!(
            "{}: {} method(s) translated, {} abandoned",
            assembly.name,
            assembly_log.translated_methods,
            assembly_log.unfinished.len()
        );
        log.merge(assembly_log);
    }

    (cfg, log)
}

fn translate_assembly(
    cfg: &mut Cfg,
    seen: &mut BTreeSet<String>,
    assembly: &Assembly,
    rules: &RuleSet,
    config: &TranslatorConfig,
) -> TranslationLog {
    let mut log = TranslationLog::default();
    for declaring in &assembly.types {
        for method in &declaring.methods {
            let Some(body) = method.body.as_ref().filter(|_| !method.is_abstract) else {
                continue;
            };
            let name = method.full_name(&declaring.name);
            if !seen.insert(name.clone()) {
                warn!("skipping duplicate method {name}");
                log.skipped_duplicates += 1;
                continue;
            }
            if method.first_line().is_none() {
                warn!("skipping {name}: no line information");
                log.skipped_no_debug_info += 1;
                continue;
            }

            let translation = translate_method(cfg, declaring, method, body, rules, config);
            let count = body.instructions.len();
            match &translation.outcome {
                Outcome::Translated => {
                    debug!("translated {name}");
                    log.record_translated(count);
                }
                Outcome::Abandoned { reason, remaining } => {
                    warn!("abandoned translation of {name}: {reason} ({remaining} instruction(s) left)");
                    log.record_unfinished(&name, count, *remaining);
                    match reason {
                        AbandonReason::Timeout => log.timed_out += 1,
                        AbandonReason::UnknownInstruction(mnemonic) => {
                            log.record_unknown_instruction(mnemonic)
                        }
                        AbandonReason::UnhandledExceptionRegion => {
                            log.record_unknown_instruction(UNHANDLED_EXCEPTION)
                        }
                        AbandonReason::UnsupportedExceptionRegion | AbandonReason::Internal(_) => {}
                    }
                }
            }
            if translation.commit {
                cfg.commit(translation.procedure);
            }
        }
    }
    log
}
