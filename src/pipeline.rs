use log::{debug, info};

use crate::cfg::Cfg;
use crate::error::PipelineError;
use crate::ir::Assembly;
use crate::report::TranslationLog;
use crate::rules::RuleSet;
use crate::tenv::{TypeEnvironment, build_type_environment};
use crate::translate::{TranslatorConfig, build_cfg};

/// Assemblies handed to the pipeline. Reference assemblies only contribute types.
#[derive(Clone, Debug, Default)]
pub(crate) struct Program {
    pub(crate) inputs: Vec<Assembly>,
    pub(crate) references: Vec<Assembly>,
}

/// Everything a completed run produces.
pub(crate) struct PipelineOutput {
    pub(crate) type_environment: TypeEnvironment,
    pub(crate) cfg: Cfg,
    pub(crate) log: TranslationLog,
}

/// Stage controller: load, then the type environment and CFG passes, then finish.
pub(crate) struct Pipeline {
    config: TranslatorConfig,
    rules: RuleSet,
    program: Option<Program>,
    type_environment: Option<TypeEnvironment>,
    control_flow: Option<(Cfg, TranslationLog)>,
}

impl Pipeline {
    pub(crate) fn new(config: TranslatorConfig, rules: RuleSet) -> Self {
        for rule in rules.metadata() {
            debug!("rule {} ({}): {}", rule.id, rule.name, rule.description);
        }
        Self {
            config,
            rules,
            program: None,
            type_environment: None,
            control_flow: None,
        }
    }

    pub(crate) fn load(&mut self, program: Program) {
        info!(
            "loaded {} input and {} reference assembly(ies)",
            program.inputs.len(),
            program.references.len()
        );
        self.program = Some(program);
        self.type_environment = None;
        self.control_flow = None;
    }

    pub(crate) fn type_environment(&mut self) -> Result<&TypeEnvironment, PipelineError> {
        let program = self.program.as_ref().ok_or(PipelineError::MissingInput {
            stage: "type-environment",
            requires: "load",
        })?;
        let environment = build_type_environment(&program.inputs, &program.references);
        info!(
            "type environment: {} type(s), {} resolution(s)",
            environment.len(),
            environment.resolutions()
        );
        Ok(self.type_environment.insert(environment))
    }

    pub(crate) fn control_flow(&mut self) -> Result<&Cfg, PipelineError> {
        let program = self.program.as_ref().ok_or(PipelineError::MissingInput {
            stage: "cfg",
            requires: "load",
        })?;
        let (cfg, log) = build_cfg(&program.inputs, &self.rules, &self.config);
        info!("cfg: {} procedure(s), {} node(s)", cfg.len(), cfg.node_count());
        let (cfg, _) = self.control_flow.insert((cfg, log));
        Ok(cfg)
    }

    pub(crate) fn finish(self) -> Result<PipelineOutput, PipelineError> {
        let type_environment = self.type_environment.ok_or(PipelineError::MissingInput {
            stage: "finish",
            requires: "type-environment",
        })?;
        let (cfg, log) = self.control_flow.ok_or(PipelineError::MissingInput {
            stage: "finish",
            requires: "cfg",
        })?;
        Ok(PipelineOutput {
            type_environment,
            cfg,
            log,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Instruction, MethodBody, MethodDef, Operand, TypeDef};

    fn program() -> Program {
        let method = MethodDef {
            name: "Run".to_string(),
            parameters: Vec::new(),
            return_type: "System.Void".to_string(),
            is_static: true,
            is_abstract: false,
            source_file: Some("Job.cs".to_string()),
            body: Some(MethodBody {
                locals: Vec::new(),
                instructions: vec![Instruction {
                    offset: 0,
                    opcode: "ret".to_string(),
                    operand: Operand::None,
                    line: Some(3),
                }],
                exception_handlers: Vec::new(),
            }),
        };
        Program {
            inputs: vec![Assembly {
                name: "App".to_string(),
                types: vec![TypeDef {
                    name: "App.Job".to_string(),
                    base: None,
                    interfaces: Vec::new(),
                    fields: Vec::new(),
                    methods: vec![method],
                }],
            }],
            references: Vec::new(),
        }
    }

    #[test]
    fn stages_require_loaded_program() {
        let mut pipeline = Pipeline::new(TranslatorConfig::default(), RuleSet::standard());

        assert_eq!(
            pipeline.type_environment().err(),
            Some(PipelineError::MissingInput {
                stage: "type-environment",
                requires: "load",
            })
        );
        assert!(pipeline.control_flow().is_err());
    }

    #[test]
    fn finish_requires_both_outputs() {
        let mut pipeline = Pipeline::new(TranslatorConfig::default(), RuleSet::standard());
        pipeline.load(program());
        pipeline.type_environment().expect("type environment");

        let result = pipeline.finish();

        assert_eq!(
            result.err(),
            Some(PipelineError::MissingInput {
                stage: "finish",
                requires: "cfg",
            })
        );
    }

    #[test]
    fn full_run_produces_both_outputs() {
        let mut pipeline = Pipeline::new(TranslatorConfig::default(), RuleSet::standard());
        pipeline.load(program());
        pipeline.type_environment().expect("type environment");
        pipeline.control_flow().expect("cfg");

        let output = pipeline.finish().expect("finish");

        assert!(output.cfg.contains("System.Void App.Job::Run()"));
        assert!(output.type_environment.get("App.Job").is_some());
        assert_eq!(output.log.translated_methods, 1);
    }
}
