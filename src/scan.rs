use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::debug;
use zip::ZipArchive;

use crate::ir::Assembly;
use crate::pipeline::Program;

/// Assemblies decoded from the inputs, with type counts for reporting.
pub(crate) struct ScanOutput {
    pub(crate) program: Program,
    pub(crate) type_count: usize,
}

pub(crate) fn scan_inputs(input: &Path, references: &[PathBuf]) -> Result<ScanOutput> {
    let mut program = Program::default();
    let mut type_count = 0;

    scan_path(input, true, &mut program.inputs, &mut type_count)?;

    // Keep deterministic ordering by sorting reference entries and directory listings.
    let mut reference_entries = references.to_vec();
    reference_entries.sort_by(|a, b| path_key(a).cmp(&path_key(b)));

    for entry in reference_entries {
        scan_path(&entry, true, &mut program.references, &mut type_count)?;
    }

    Ok(ScanOutput {
        program,
        type_count,
    })
}

fn scan_path(
    path: &Path,
    strict: bool,
    assemblies: &mut Vec<Assembly>,
    type_count: &mut usize,
) -> Result<()> {
    if path.is_dir() {
        scan_dir(path, assemblies, type_count)?;
        return Ok(());
    }

    let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");
    match extension {
        "json" => scan_json_file(path, assemblies, type_count),
        "zip" => scan_bundle(path, assemblies, type_count),
        _ => {
            if strict {
                anyhow::bail!("unsupported input file: {}", path.display())
            } else {
                debug!("ignoring {}", path.display());
                Ok(())
            }
        }
    }
}

fn scan_dir(path: &Path, assemblies: &mut Vec<Assembly>, type_count: &mut usize) -> Result<()> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(path)
        .with_context(|| format!("failed to read directory {}", path.display()))?
    {
        let entry = entry.with_context(|| format!("failed to read entry under {}", path.display()))?;
        entries.push(entry.path());
    }

    entries.sort_by(|a, b| path_key(a).cmp(&path_key(b)));

    for entry in entries {
        if entry.is_dir() {
            scan_dir(&entry, assemblies, type_count)?;
        } else {
            scan_path(&entry, false, assemblies, type_count)?;
        }
    }

    Ok(())
}

fn scan_json_file(path: &Path, assemblies: &mut Vec<Assembly>, type_count: &mut usize) -> Result<()> {
    let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let assembly = parse_assembly(&data)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    push_assembly(assembly, assemblies, type_count);
    Ok(())
}

fn scan_bundle(path: &Path, assemblies: &mut Vec<Assembly>, type_count: &mut usize) -> Result<()> {
    let file = fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut archive =
        ZipArchive::new(file).with_context(|| format!("failed to read {}", path.display()))?;

    let mut entry_names = Vec::new();
    for index in 0..archive.len() {
        let entry = archive
            .by_index(index)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        if name.ends_with(".json") {
            entry_names.push(name);
        }
    }

    entry_names.sort();

    for name in entry_names {
        let mut entry = archive
            .by_name(&name)
            .with_context(|| format!("failed to read {}:{}", path.display(), name))?;
        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .with_context(|| format!("failed to read {}:{}", path.display(), name))?;
        let assembly = parse_assembly(&data)
            .with_context(|| format!("failed to parse {}:{}", path.display(), name))?;
        push_assembly(assembly, assemblies, type_count);
    }

    Ok(())
}

fn parse_assembly(data: &[u8]) -> Result<Assembly> {
    Ok(serde_json::from_slice(data)?)
}

fn push_assembly(assembly: Assembly, assemblies: &mut Vec<Assembly>, type_count: &mut usize) {
    debug!("loaded assembly {} ({} type(s))", assembly.name, assembly.types.len());
    *type_count += assembly.types.len();
    assemblies.push(assembly);
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::ZipWriter;
    use zip::write::SimpleFileOptions;

    fn assembly_json(name: &str, types: &[&str]) -> String {
        let types: Vec<String> = types
            .iter()
            .map(|name| format!(r#"{{"name": "{name}"}}"#))
            .collect();
        format!(r#"{{"name": "{name}", "types": [{}]}}"#, types.join(", "))
    }

    fn assembly_names(assemblies: &[Assembly]) -> Vec<&str> {
        assemblies.iter().map(|assembly| assembly.name.as_str()).collect()
    }

    #[test]
    fn scan_inputs_rejects_invalid_json() {
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        let path = temp_dir.path().join("bad.json");
        fs::write(&path, b"nope").expect("write test input");

        let result = scan_inputs(&path, &[]);

        assert!(result.is_err());
    }

    #[test]
    fn scan_inputs_rejects_unsupported_explicit_file() {
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        let path = temp_dir.path().join("App.dll");
        fs::write(&path, b"MZ").expect("write test input");

        let error = scan_inputs(&path, &[]).err().expect("unsupported input");

        assert!(error.to_string().starts_with("unsupported input file"));
    }

    #[test]
    fn scan_inputs_reads_bundle_entries_in_name_order() {
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        let path = temp_dir.path().join("bundle.zip");
        let file = fs::File::create(&path).expect("create bundle");
        let mut writer = ZipWriter::new(file);
        for (entry, name) in [("b.json", "Beta"), ("a.json", "Alpha"), ("notes.txt", "")] {
            writer
                .start_file(entry, SimpleFileOptions::default())
                .expect("start entry");
            let contents = if name.is_empty() {
                "notes".to_string()
            } else {
                assembly_json(name, &["App.Item"])
            };
            writer.write_all(contents.as_bytes()).expect("write entry");
        }
        writer.finish().expect("finish bundle");

        let result = scan_inputs(&path, &[]).expect("scan bundle");

        assert_eq!(assembly_names(&result.program.inputs), vec!["Alpha", "Beta"]);
        assert_eq!(result.type_count, 2);
    }

    #[test]
    fn scan_inputs_walks_directories_and_keeps_references_apart() {
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        let input_dir = temp_dir.path().join("input");
        fs::create_dir_all(input_dir.join("nested")).expect("create input dirs");
        fs::write(input_dir.join("z.json"), assembly_json("Zeta", &["App.A", "App.B"]))
            .expect("write z");
        fs::write(input_dir.join("nested").join("m.json"), assembly_json("Mid", &[]))
            .expect("write m");
        fs::write(input_dir.join("readme.md"), "ignored").expect("write readme");
        let reference = temp_dir.path().join("lib.json");
        fs::write(&reference, assembly_json("Lib", &["Lib.Base"])).expect("write reference");

        let result = scan_inputs(&input_dir, &[reference]).expect("scan directory");

        assert_eq!(assembly_names(&result.program.inputs), vec!["Mid", "Zeta"]);
        assert_eq!(assembly_names(&result.program.references), vec!["Lib"]);
        assert_eq!(result.type_count, 3);
    }
}
