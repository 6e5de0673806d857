mod cfg;
mod error;
mod exceptions;
mod ir;
mod pipeline;
mod report;
mod rules;
mod scan;
mod sil;
mod tenv;
mod translate;

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{LevelFilter, info, warn};
use simplelog::{Config, WriteLogger};

use crate::cfg::SavedCfg;
use crate::pipeline::Pipeline;
use crate::rules::RuleSet;
use crate::scan::scan_inputs;
use crate::translate::TranslatorConfig;

/// CLI arguments for cilsil execution.
#[derive(Parser, Debug)]
#[command(
    name = "cilsil",
    about = "Translates CIL method bodies into a SIL control-flow graph and type environment.",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    #[arg(long, global = true, conflicts_with = "verbose")]
    quiet: bool,
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Translate metadata dumps into CFG and type environment files.
    Translate(TranslateArgs),
    /// Print procedures of saved CFG files as text.
    Print {
        /// Comma-separated procedure names; every procedure when omitted.
        #[arg(long, value_delimiter = ',')]
        procs: Vec<String>,
        #[arg(required = true, value_name = "FILE")]
        files: Vec<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct TranslateArgs {
    /// Metadata dump (.json), bundle (.zip) or directory to translate.
    #[arg(long, value_name = "PATH")]
    input: PathBuf,
    /// Assemblies that only contribute types.
    #[arg(long, value_name = "PATH")]
    reference: Vec<PathBuf>,
    #[arg(long, value_name = "PATH", default_value = "cfg.json")]
    cfg: PathBuf,
    #[arg(long, value_name = "PATH", default_value = "tenv.json")]
    tenv: PathBuf,
    /// Graphviz export of the CFG.
    #[arg(long, value_name = "PATH")]
    dot: Option<PathBuf>,
    /// Graphviz export of the inheritance graph.
    #[arg(long, value_name = "PATH")]
    tenv_dot: Option<PathBuf>,
    /// Textual rendering of the CFG and type environment.
    #[arg(long, value_name = "PATH")]
    text: Option<PathBuf>,
    #[arg(long, value_name = "N", default_value_t = TranslatorConfig::default().max_offset_visits)]
    max_offset_visits: usize,
    #[arg(long, value_name = "N", default_value_t = TranslatorConfig::default().max_iterations)]
    max_iterations: usize,
    #[arg(long)]
    timing: bool,
}

impl Cli {
    fn level(&self) -> LevelFilter {
        if self.quiet {
            LevelFilter::Error
        } else if self.verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        }
    }
}

impl TranslateArgs {
    fn translator_config(&self) -> TranslatorConfig {
        TranslatorConfig {
            max_offset_visits: self.max_offset_visits,
            max_iterations: self.max_iterations,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    WriteLogger::init(cli.level(), Config::default(), io::stderr())
        .context("failed to install logger")?;
    match cli.command {
        Commands::Translate(args) => translate(args),
        Commands::Print { procs, files } => {
            let mut writer = output_writer(Path::new("-"))?;
            print_procedures(&files, &procs, writer.as_mut())?;
            writer.flush().context("failed to write procedures")
        }
    }
}

fn translate(args: TranslateArgs) -> Result<()> {
    if !args.input.exists() {
        anyhow::bail!("input not found: {}", args.input.display());
    }
    for entry in &args.reference {
        if !entry.exists() {
            anyhow::bail!("reference not found: {}", entry.display());
        }
    }

    let started_at = Instant::now();
    let scan = scan_inputs(&args.input, &args.reference)?;
    let type_count = scan.type_count;

    let mut pipeline = Pipeline::new(args.translator_config(), RuleSet::standard());
    pipeline.load(scan.program);
    pipeline.type_environment()?;
    pipeline.control_flow()?;
    let output = pipeline.finish()?;
    output.log.report();

    write_output(&args.cfg, "CFG", |writer| {
        serde_json::to_writer_pretty(&mut *writer, &output.cfg.to_json())?;
        Ok(writer.write_all(b"\n")?)
    })?;
    write_output(&args.tenv, "type environment", |writer| {
        serde_json::to_writer_pretty(&mut *writer, &output.type_environment)?;
        Ok(writer.write_all(b"\n")?)
    })?;
    if let Some(path) = args.dot.as_deref() {
        write_output(path, "DOT", |writer| {
            Ok(writer.write_all(output.cfg.to_dot().as_bytes())?)
        })?;
    }
    if let Some(path) = args.tenv_dot.as_deref() {
        write_output(path, "type environment DOT", |writer| {
            Ok(writer.write_all(output.type_environment.to_dot().as_bytes())?)
        })?;
    }
    if let Some(path) = args.text.as_deref() {
        write_output(path, "text", |writer| {
            write!(writer, "{}", output.cfg)?;
            Ok(write!(writer, "{}", output.type_environment)?)
        })?;
    }

    if args.timing {
        info!(
            "timing: total_ms={} types={} procedures={} nodes={}",
            started_at.elapsed().as_millis(),
            type_count,
            output.cfg.len(),
            output.cfg.node_count()
        );
    }

    Ok(())
}

/// Renders the named procedures of each saved CFG, or all of them when `procs` is empty.
fn print_procedures(files: &[PathBuf], procs: &[String], writer: &mut dyn Write) -> Result<()> {
    for file in files {
        let data = fs::read(file).with_context(|| format!("failed to read {}", file.display()))?;
        let saved: SavedCfg = serde_json::from_slice(&data)
            .with_context(|| format!("{} is not a saved CFG", file.display()))?;
        let selected = saved.select(procs);
        if selected.is_empty() {
            warn!("no matching procedure in {}", file.display());
        }
        for procedure in selected {
            writeln!(writer, "{procedure}")?;
        }
    }
    Ok(())
}

fn write_output<F>(path: &Path, what: &str, render: F) -> Result<()>
where
    F: FnOnce(&mut dyn Write) -> Result<()>,
{
    let mut writer = output_writer(path)?;
    render(writer.as_mut()).with_context(|| format!("failed to write {what} output"))?;
    writer
        .flush()
        .with_context(|| format!("failed to write {what} output"))
}

fn output_writer(path: &Path) -> Result<Box<dyn Write>> {
    if path == Path::new("-") {
        return Ok(Box::new(io::stdout()));
    }
    Ok(Box::new(
        File::create(path).with_context(|| format!("failed to open {}", path.display()))?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const ASSEMBLY: &str = r#"{
        "name": "App",
        "types": [{
            "name": "App.Job",
            "base": "System.Object",
            "fields": [{"name": "done", "field_type": "System.Boolean"}],
            "methods": [{
                "name": "Run",
                "is_static": true,
                "source_file": "Job.cs",
                "body": {
                    "instructions": [
                        {"offset": 0, "opcode": "ldc.i4.1", "line": 4},
                        {"offset": 1, "opcode": "brfalse.s", "operand": {"kind": "target", "value": 4}, "line": 4},
                        {"offset": 3, "opcode": "nop", "line": 5},
                        {"offset": 4, "opcode": "ret", "line": 6}
                    ]
                }
            }]
        }]
    }"#;

    fn translate_args(input: PathBuf, dir: &Path) -> TranslateArgs {
        let cli = Cli::parse_from([
            "cilsil".to_string(),
            "translate".to_string(),
            "--input".to_string(),
            input.display().to_string(),
            "--cfg".to_string(),
            dir.join("cfg.json").display().to_string(),
            "--tenv".to_string(),
            dir.join("tenv.json").display().to_string(),
            "--dot".to_string(),
            dir.join("cfg.dot").display().to_string(),
            "--tenv-dot".to_string(),
            dir.join("tenv.dot").display().to_string(),
            "--text".to_string(),
            dir.join("cfg.txt").display().to_string(),
        ]);
        match cli.command {
            Commands::Translate(args) => args,
            other => panic!("expected translate, got {other:?}"),
        }
    }

    #[test]
    fn cli_defaults_match_translator_config() {
        let cli = Cli::parse_from(["cilsil", "translate", "--input", "app.json"]);

        assert_eq!(cli.level(), LevelFilter::Info);
        let Commands::Translate(args) = cli.command else {
            panic!("expected translate");
        };
        assert_eq!(args.translator_config(), TranslatorConfig::default());
        assert_eq!(args.cfg, PathBuf::from("cfg.json"));
        assert_eq!(args.tenv, PathBuf::from("tenv.json"));
    }

    #[test]
    fn print_splits_procedure_list() {
        let cli = Cli::parse_from([
            "cilsil",
            "print",
            "--procs",
            "A::Run(),B::Stop()",
            "cfg.json",
            "--quiet",
        ]);

        assert_eq!(cli.level(), LevelFilter::Error);
        let Commands::Print { procs, files } = cli.command else {
            panic!("expected print");
        };
        assert_eq!(procs, vec!["A::Run()", "B::Stop()"]);
        assert_eq!(files, vec![PathBuf::from("cfg.json")]);
    }

    #[test]
    fn translate_writes_every_requested_output() {
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        let input = temp_dir.path().join("app.json");
        fs::write(&input, ASSEMBLY).expect("write input");

        translate(translate_args(input, temp_dir.path())).expect("translate");

        let cfg: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(temp_dir.path().join("cfg.json")).expect("read cfg"),
        )
        .expect("parse cfg");
        let procedure = &cfg["procs"]["System.Void App.Job::Run()"];
        assert!(procedure["pd_nodes"].as_array().expect("nodes").len() > 3);

        let tenv: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(temp_dir.path().join("tenv.json")).expect("read tenv"),
        )
        .expect("parse tenv");
        assert_eq!(tenv["App.Job"]["instance_fields"][0]["name"], "App.Job.done");

        let dot = fs::read_to_string(temp_dir.path().join("cfg.dot")).expect("read dot");
        assert!(dot.starts_with("digraph"));
        let tenv_dot = fs::read_to_string(temp_dir.path().join("tenv.dot")).expect("read tenv dot");
        assert!(tenv_dot.contains("\"App.Job\";"));
        let text = fs::read_to_string(temp_dir.path().join("cfg.txt")).expect("read text");
        assert!(text.contains("App.Job"));
    }

    #[test]
    fn translate_rejects_missing_input() {
        let temp_dir = tempfile::tempdir().expect("create temp dir");

        let result = translate(translate_args(temp_dir.path().join("missing.json"), temp_dir.path()));

        assert!(result.is_err());
    }

    #[test]
    fn print_renders_selected_procedures_from_saved_cfg() {
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        let input = temp_dir.path().join("app.json");
        fs::write(&input, ASSEMBLY).expect("write input");
        translate(translate_args(input, temp_dir.path())).expect("translate");
        let saved = temp_dir.path().join("cfg.json");
        let text = fs::read_to_string(temp_dir.path().join("cfg.txt")).expect("read text");

        let mut selected: Vec<u8> = Vec::new();
        print_procedures(
            std::slice::from_ref(&saved),
            &["System.Void App.Job::Run()".to_string()],
            &mut selected,
        )
        .expect("print selected");
        let selected = String::from_utf8(selected).expect("utf8 output");

        assert!(selected.starts_with("procedure System.Void App.Job::Run() (pd 0)\n"));
        assert!(text.starts_with(&selected));

        let mut missing: Vec<u8> = Vec::new();
        print_procedures(&[saved], &["System.Void App.Job::Stop()".to_string()], &mut missing)
            .expect("print missing");
        assert!(missing.is_empty());
    }

    #[test]
    fn print_rejects_files_that_are_not_cfgs() {
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        let path = temp_dir.path().join("tenv.json");
        fs::write(&path, r#"{"App.Job": {"supers": []}}"#).expect("write tenv");

        let error = print_procedures(&[path], &[], &mut Vec::<u8>::new()).err().expect("not a cfg");

        assert!(error.to_string().ends_with("is not a saved CFG"));
    }
}
