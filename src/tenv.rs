//! Type environment: one flattened [`TypeEntry`] per type, resolved across the inheritance graph.

use std::collections::BTreeMap;
use std::fmt;

use log::debug;
use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::ir::{Assembly, FieldDef, FieldRef, TypeDef};
use crate::sil::types::{FieldIdent, Struct, Typ, TypeEntry};

#[derive(Clone, Debug)]
enum Slot {
    /// Resolution started but has not finished; breaks inheritance cycles.
    InProgress,
    Resolved {
        entry: TypeEntry,
        /// Immediate supertypes that resolved, kept for the graph export.
        parents: Vec<String>,
    },
}

/// Resolved type entries keyed by fully qualified type name.
#[derive(Clone, Debug, Default)]
pub(crate) struct TypeEnvironment {
    slots: BTreeMap<String, Slot>,
    resolutions: usize,
}

impl TypeEnvironment {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(&self, name: &str) -> Option<&TypeEntry> {
        match self.slots.get(name) {
            Some(Slot::Resolved { entry, .. }) => Some(entry),
            _ => None,
        }
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.slots.contains_key(name)
    }

    /// Resolved entries in name order.
    pub(crate) fn entries(&self) -> impl Iterator<Item = &TypeEntry> + '_ {
        self.slots.values().filter_map(|slot| match slot {
            Slot::Resolved { entry, .. } => Some(entry),
            Slot::InProgress => None,
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.entries().count()
    }

    /// Number of type entries built so far; memoised lookups do not count.
    pub(crate) fn resolutions(&self) -> usize {
        self.resolutions
    }

    /// Inheritance graph in Graphviz DOT: one edge per immediate supertype.
    pub(crate) fn to_dot(&self) -> String {
        let mut dot = String::from("digraph tenv {\n  rankdir=BT;\n  node [shape=box];\n");
        for (name, slot) in &self.slots {
            let Slot::Resolved { parents, .. } = slot else {
                continue;
            };
            dot.push_str(&format!("  \"{name}\";\n"));
            for parent in parents {
                dot.push_str(&format!("  \"{name}\" -> \"{parent}\";\n"));
            }
        }
        dot.push_str("}\n");
        dot
    }
}

impl Serialize for TypeEnvironment {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.len()))?;
        for entry in self.entries() {
            map.serialize_entry(&entry.type_name, &entry.type_struct)?;
        }
        map.end()
    }
}

impl fmt::Display for TypeEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in self.entries() {
            write!(f, "{entry}")?;
        }
        Ok(())
    }
}

/// Builds type entries on demand from the loaded type definitions.
pub(crate) struct TypeResolver<'a> {
    definitions: BTreeMap<&'a str, &'a TypeDef>,
    environment: TypeEnvironment,
}

impl<'a> TypeResolver<'a> {
    /// The first definition of a name wins when several assemblies declare it.
    pub(crate) fn new<I>(assemblies: I) -> Self
    where
        I: IntoIterator<Item = &'a Assembly>,
    {
        let mut definitions = BTreeMap::new();
        for assembly in assemblies {
            for definition in &assembly.types {
                definitions.entry(definition.name.as_str()).or_insert(definition);
            }
        }
        Self {
            definitions,
            environment: TypeEnvironment::new(),
        }
    }

    pub(crate) fn resolve(&mut self, name: &str) -> Option<&TypeEntry> {
        self.resolve_slot(name);
        self.environment.get(name)
    }

    pub(crate) fn finish(self) -> TypeEnvironment {
        self.environment
    }

    fn resolve_slot(&mut self, name: &str) {
        if self.environment.contains(name) {
            return;
        }
        let Some(definition) = self.definitions.get(name).copied() else {
            debug!("no metadata for type {name}");
            return;
        };
        self.environment
            .slots
            .insert(name.to_string(), Slot::InProgress);

        let mut inherited = Struct::default();
        let mut parents = Vec::new();
        for parent in definition.interfaces.iter().chain(definition.base.iter()) {
            self.resolve_slot(parent);
            let Some(entry) = self.environment.get(parent) else {
                debug!("skipping unresolved supertype {parent} of {name}");
                continue;
            };
            let parent_struct = &entry.type_struct;
            inherited
                .instance_fields
                .extend(parent_struct.instance_fields.iter().cloned());
            inherited
                .static_fields
                .extend(parent_struct.static_fields.iter().cloned());
            inherited.supers.extend(parent_struct.supers.iter().cloned());
            parents.push(parent.clone());
        }

        let entry = TypeEntry {
            type_name: name.to_string(),
            type_struct: own_struct(definition, inherited, &parents),
        };
        self.environment.resolutions += 1;
        self.environment
            .slots
            .insert(name.to_string(), Slot::Resolved { entry, parents });
    }
}

/// Own fields ahead of inherited ones; supertypes list inherited names, then immediate ones.
fn own_struct(definition: &TypeDef, inherited: Struct, parents: &[String]) -> Struct {
    let describe = |field: &FieldDef| {
        let reference = FieldRef {
            declaring_type: definition.name.clone(),
            name: field.name.clone(),
            field_type: field.field_type.clone(),
        };
        FieldIdent::new(reference.full_name(), Typ::from_type_name(&field.field_type))
    };
    let (statics, instances): (Vec<_>, Vec<_>) =
        definition.fields.iter().partition(|field| field.is_static);

    let mut instance_fields: Vec<FieldIdent> = instances.into_iter().map(describe).collect();
    instance_fields.extend(inherited.instance_fields);
    let mut static_fields: Vec<FieldIdent> = statics.into_iter().map(describe).collect();
    static_fields.extend(inherited.static_fields);
    let mut supers = inherited.supers;
    supers.extend(parents.iter().cloned());

    Struct {
        instance_fields,
        static_fields,
        supers,
        methods: definition
            .methods
            .iter()
            .map(|method| method.full_name(&definition.name))
            .collect(),
    }
}

/// Resolves every type of the translated and reference assemblies.
pub(crate) fn build_type_environment(inputs: &[Assembly], references: &[Assembly]) -> TypeEnvironment {
    let mut resolver = TypeResolver::new(inputs.iter().chain(references));
    let names: Vec<String> = inputs
        .iter()
        .chain(references)
        .flat_map(|assembly| assembly.types.iter().map(|definition| definition.name.clone()))
        .collect();
    for name in &names {
        resolver.resolve(name);
    }
    let environment = resolver.finish();
    debug!("resolved {} type(s)", environment.len());
    environment
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::MethodDef;

    fn field(name: &str, field_type: &str, is_static: bool) -> FieldDef {
        FieldDef {
            name: name.to_string(),
            field_type: field_type.to_string(),
            is_static,
        }
    }

    fn type_def(name: &str, base: Option<&str>, interfaces: &[&str], fields: Vec<FieldDef>) -> TypeDef {
        TypeDef {
            name: name.to_string(),
            base: base.map(str::to_string),
            interfaces: interfaces.iter().map(|name| name.to_string()).collect(),
            fields,
            methods: Vec::new(),
        }
    }

    fn assembly(types: Vec<TypeDef>) -> Assembly {
        Assembly {
            name: "App".to_string(),
            types,
        }
    }

    fn field_names(entry: &TypeEntry) -> Vec<&str> {
        entry
            .type_struct
            .instance_fields
            .iter()
            .map(|field| field.name.as_str())
            .collect()
    }

    #[test]
    fn own_fields_come_before_inherited_ones() {
        let assemblies = vec![assembly(vec![
            type_def(
                "App.Derived",
                Some("App.Base"),
                &[],
                vec![field("y", "System.Int32", false), field("Shared", "System.String", true)],
            ),
            type_def("App.Base", Some("System.Object"), &[], vec![field("x", "System.Int32", false)]),
        ])];
        let mut resolver = TypeResolver::new(&assemblies);

        let derived = resolver.resolve("App.Derived").expect("derived resolved").clone();

        assert_eq!(field_names(&derived), vec!["App.Derived.y", "App.Base.x"]);
        assert_eq!(derived.type_struct.static_fields[0].to_string(), "App.Derived.Shared:System.String*");
        assert_eq!(derived.type_struct.supers, vec!["App.Base"]);
    }

    #[test]
    fn shared_base_is_resolved_once() {
        let assemblies = vec![assembly(vec![
            type_def("App.Left", Some("App.Base"), &[], Vec::new()),
            type_def("App.Right", Some("App.Base"), &[], Vec::new()),
            type_def("App.Base", None, &[], vec![field("id", "System.Int32", false)]),
        ])];
        let mut resolver = TypeResolver::new(&assemblies);

        resolver.resolve("App.Left");
        resolver.resolve("App.Right");
        resolver.resolve("App.Base");
        let environment = resolver.finish();

        assert_eq!(environment.resolutions(), 3);
        assert_eq!(environment.len(), 3);
        assert_eq!(
            field_names(environment.get("App.Right").expect("right")),
            vec!["App.Base.id"]
        );
    }

    #[test]
    fn supertypes_accumulate_transitively() {
        let assemblies = vec![assembly(vec![
            type_def("App.Stream", Some("App.Resource"), &["App.IDisposable"], Vec::new()),
            type_def("App.Resource", None, &["App.ICloseable"], Vec::new()),
            type_def("App.IDisposable", None, &[], Vec::new()),
            type_def("App.ICloseable", None, &[], Vec::new()),
        ])];

        let environment = build_type_environment(&assemblies, &[]);

        assert_eq!(
            environment.get("App.Stream").expect("stream").type_struct.supers,
            vec!["App.ICloseable", "App.IDisposable", "App.Resource"]
        );
        assert!(environment.to_dot().contains("\"App.Stream\" -> \"App.Resource\";"));
    }

    #[test]
    fn cyclic_and_missing_bases_terminate() {
        let assemblies = vec![assembly(vec![
            type_def("App.A", Some("App.B"), &[], vec![field("a", "System.Int32", false)]),
            type_def("App.B", Some("App.A"), &["App.Missing"], vec![field("b", "System.Int32", false)]),
        ])];

        let environment = build_type_environment(&assemblies, &[]);

        let a = environment.get("App.A").expect("a resolved");
        let b = environment.get("App.B").expect("b resolved");
        assert_eq!(field_names(a), vec!["App.A.a", "App.B.b"]);
        assert_eq!(field_names(b), vec!["App.B.b"]);
        assert!(b.type_struct.supers.is_empty());
        assert!(environment.get("App.Missing").is_none());
    }

    #[test]
    fn reference_types_join_the_environment_and_serialize() {
        let mut worker = type_def("App.Worker", Some("Lib.Service"), &[], Vec::new());
        worker.methods.push(MethodDef {
            name: "Run".to_string(),
            parameters: Vec::new(),
            return_type: "System.Void".to_string(),
            is_static: false,
            is_abstract: false,
            source_file: None,
            body: None,
        });
        let inputs = vec![assembly(vec![worker])];
        let references = vec![assembly(vec![type_def(
            "Lib.Service",
            None,
            &[],
            vec![field("Instances", "System.Int32", true)],
        )])];

        let environment = build_type_environment(&inputs, &references);
        let json = serde_json::to_value(&environment).expect("serialize environment");

        assert_eq!(json["App.Worker"]["supers"][0], "Lib.Service");
        assert_eq!(json["App.Worker"]["static_fields"][0]["name"], "Lib.Service.Instances");
        assert_eq!(json["App.Worker"]["methods"][0], "System.Void App.Worker::Run()");
        assert!(environment.to_string().contains("  static Lib.Service.Instances:int\n"));
    }
}
