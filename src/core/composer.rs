// src/core/composer.rs

//! Builds a stage's environment from its definition layers.
//!
//! The composed layer list (the MRO) is: built-in and file plugins first, in
//! declaration order and deduplicated by path, then the inheritance chain from
//! the root-most parent down to the selected stage file. Later layers win when
//! they set the same field of a leaf.

use super::{
    cache::ComposedHasher,
    loader::{self, DefinitionLayer, LoadError},
    magic::{self, MagicError, MagicFunction, MagicKind},
    plugins,
    projector::ProcessEnv,
    stage::{Stage, StageFile},
    tree::EnvTree,
    types::expand_path,
};
use crate::{
    constants::{
        DEFAULT_EXCLUDES, DEFINITION_GLOB, DEFINITION_SCOPE_MODULE, EMERGENCY_ENV_NAME, SOURCES_GLOB,
    },
    models::{GroupDecl, VarDecl, WatchKind, WatchRoot},
    script::{
        ModuleObj, ModuleRegistry, ScriptError, ScriptHost, Value,
        interp::{self, Importer, Scope},
        parser,
    },
};
use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ComposeError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Magic(#[from] MagicError),
    #[error("{location}: {source}")]
    Script {
        location: String,
        #[source]
        source: ScriptError,
    },
}

// --- Magic registry ---

/// Commands, contexts, hooks and boot code of an environment, in
/// registration order.
#[derive(Debug, Clone, Default)]
pub struct MagicRegistry {
    functions: Vec<MagicFunction>,
}

impl MagicRegistry {
    /// Registers a function. An entry with the same kind, namespace and name
    /// is replaced in place, so a child layer shadows its parent.
    pub fn register(&mut self, function: MagicFunction) {
        let key = function.key();
        match self.functions.iter_mut().find(|f| f.key() == key) {
            Some(slot) => {
                log::debug!("'{}' shadows '{}'.", function.location(), slot.location());
                *slot = function;
            }
            None => self.functions.push(function),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &MagicFunction> {
        self.functions.iter()
    }

    pub fn of_kind(&self, kind: MagicKind) -> impl Iterator<Item = &MagicFunction> {
        self.functions.iter().filter(move |f| f.kind == kind)
    }

    /// A command by its qualified name (`ns.name` or `name`).
    pub fn command(&self, qualified_name: &str) -> Option<&MagicFunction> {
        self.of_kind(MagicKind::Command)
            .find(|f| f.qualified_name() == qualified_name)
    }

    pub fn command_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .of_kind(MagicKind::Command)
            .map(MagicFunction::qualified_name)
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

// --- Composed environment ---

#[derive(Debug, Clone)]
pub struct ComposedEnv {
    pub name: String,
    pub stage: Stage,
    /// The selected stage file.
    pub definition: PathBuf,
    /// Project root: the directory of the selected stage file.
    pub root: PathBuf,
    /// Layer paths in application order.
    pub layers: Vec<PathBuf>,
    pub tree: EnvTree,
    pub magic: MagicRegistry,
    pub watch: Vec<WatchRoot>,
    /// Script module roots.
    pub sources: Vec<PathBuf>,
    pub verbose_run: bool,
    /// Hash over every layer's path and content. Equal hashes mean an
    /// identical composition.
    pub hash: String,
}

impl ComposedEnv {
    pub fn is_emergency(&self) -> bool {
        self.name == EMERGENCY_ENV_NAME
    }
}

/// Per-leaf declaration state merged across layers before it lands in the tree.
#[derive(Debug, Default)]
struct Pending {
    raw: Option<bool>,
    default: Option<toml::Value>,
    default_factory: Option<(String, PathBuf)>,
    setter: Option<(String, PathBuf)>,
}

struct Composer {
    tree: EnvTree,
    pending: HashMap<String, Pending>,
    group_raw: HashMap<String, bool>,
    magic: MagicRegistry,
}

/// Composes the environment of `stage_file`.
///
/// Script modules named in `[env].imports` are imported through `registry`,
/// whose roots are set to the layers' `sources`. Scripts run against the
/// registry's host.
pub fn compose(
    stage_file: &StageFile,
    registry: &ModuleRegistry,
    process_env: &ProcessEnv,
) -> Result<ComposedEnv, ComposeError> {
    let chain = loader::load_chain(&stage_file.path)?;
    let layers = linearize(chain)?;
    let selected = layers
        .last()
        .ok_or_else(|| LoadError::Read {
            path: stage_file.path.clone(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        })?
        .clone();
    let root = selected.root.clone();

    let name = layers
        .iter()
        .rev()
        .find_map(|l| l.file.env.name.clone())
        .unwrap_or_else(|| default_env_name(&root));

    let sources: Vec<PathBuf> = unique(
        layers
            .iter()
            .flat_map(|l| l.file.env.sources.iter().map(|s| l.resolve(s)))
            .collect(),
    );
    registry.set_roots(sources.clone());

    let scope = Arc::new(ModuleObj::new(DEFINITION_SCOPE_MODULE, None, ""));
    scope.set("root", Value::str(root.to_string_lossy()));
    scope.set("stage", Value::str(stage_file.stage.name.clone()));
    for layer in &layers {
        for import in &layer.file.env.imports {
            let module = registry.import(import, None).map_err(|source| ComposeError::Script {
                location: format!("{}:[env.imports]", layer.path.display()),
                source,
            })?;
            let binding = import.rsplit('.').next().unwrap_or(import);
            scope.set(binding, Value::Module(module));
        }
    }

    let mut composer = Composer {
        tree: EnvTree::new(name.clone(), root.clone(), scope).with_host(registry.host()),
        pending: HashMap::new(),
        group_raw: HashMap::new(),
        magic: MagicRegistry::default(),
    };
    composer.builtin_leaves(&selected, &stage_file.stage);

    for layer in &layers {
        composer.apply_vars(&[], &layer.file.vars, layer);
        composer.apply_groups(&[], &layer.file.groups, layer);
        composer.register_magic(layer)?;
    }
    composer.finish_path(&layers, process_env);
    composer.finish_leaves()?;

    let mut hasher = ComposedHasher::new();
    hasher.update("stage", stage_file.stage.name.as_bytes());
    for layer in &layers {
        hasher.update(&layer.path.to_string_lossy(), layer.content_hash.as_bytes());
    }

    let env = ComposedEnv {
        name,
        stage: stage_file.stage.clone(),
        definition: selected.path.clone(),
        watch: watch_roots(&layers, &sources),
        layers: layers.iter().map(|l| l.path.clone()).collect(),
        verbose_run: layers.iter().rev().find_map(|l| l.file.env.verbose_run).unwrap_or(false),
        hash: hasher.finish(),
        tree: composer.tree,
        magic: composer.magic,
        sources,
        root,
    };
    log::debug!(
        "Composed '{}' from {} layer(s): {} leaves, {} magic functions.",
        env.name,
        env.layers.len(),
        env.tree.len(),
        env.magic.len()
    );
    Ok(env)
}

/// The placeholder environment loaded in Emergency mode: built-in leaves
/// only, no magic. The failing definition stays watched.
pub fn emergency_env(stage_file: &StageFile, process_env: &ProcessEnv, watch: Vec<WatchRoot>) -> ComposedEnv {
    let root = stage_file
        .path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let scope = Arc::new(ModuleObj::new(DEFINITION_SCOPE_MODULE, None, ""));
    let mut tree = EnvTree::new(EMERGENCY_ENV_NAME, root.clone(), scope);

    let origin = stage_file.path.clone();
    let root_leaf = tree.entry(&[], "root", &origin);
    root_leaf.type_decl = Some("path".to_string());
    root_leaf.value = Some(Value::str(root.to_string_lossy()));
    let stage_leaf = tree.entry(&[], "stage", &origin);
    stage_leaf.type_decl = Some("str".to_string());
    stage_leaf.value = Some(Value::str(stage_file.stage.name.clone()));
    let path_leaf = tree.entry(&[], "path", &origin);
    path_leaf.type_decl = Some("list[path]".to_string());
    path_leaf.raw = true;
    path_leaf.value = Some(Value::list(
        split_path_var(process_env.get("PATH")).into_iter().map(Value::Str).collect(),
    ));

    let mut watch = watch;
    if !watch.iter().any(|w| w.path == root && w.kind == WatchKind::Definition) {
        watch.push(WatchRoot {
            path: root.clone(),
            kind: WatchKind::Definition,
            include: vec![DEFINITION_GLOB.to_string()],
            exclude: default_excludes(),
        });
    }

    ComposedEnv {
        name: EMERGENCY_ENV_NAME.to_string(),
        stage: stage_file.stage.clone(),
        definition: stage_file.path.clone(),
        root,
        layers: Vec::new(),
        tree,
        magic: MagicRegistry::default(),
        watch,
        sources: Vec::new(),
        verbose_run: false,
        hash: String::new(),
    }
}

/// Plugins declared anywhere in the chain, deduplicated by path, followed by
/// the chain itself.
fn linearize(chain: Vec<DefinitionLayer>) -> Result<Vec<DefinitionLayer>, LoadError> {
    let mut plugins: Vec<DefinitionLayer> = Vec::new();
    for layer in &chain {
        for spec in &layer.file.env.plugins {
            let plugin = plugins::resolve_plugin(spec, layer)?;
            if plugins.iter().chain(chain.iter()).all(|l| l.path != plugin.path) {
                plugins.push(plugin);
            }
        }
    }
    plugins.extend(chain);
    Ok(plugins)
}

impl Composer {
    fn builtin_leaves(&mut self, selected: &DefinitionLayer, stage: &Stage) {
        let origin = selected.path.clone();
        let root = self.tree.root.to_string_lossy().to_string();

        let leaf = self.tree.entry(&[], "root", &origin);
        leaf.type_decl = Some("path".to_string());
        leaf.value = Some(Value::Str(root));

        let leaf = self.tree.entry(&[], "stage", &origin);
        leaf.type_decl = Some("str".to_string());
        leaf.value = Some(Value::str(stage.name.clone()));

        let leaf = self.tree.entry(&[], "path", &origin);
        leaf.type_decl = Some("list[path]".to_string());
        self.pending.entry("path".to_string()).or_default().raw = Some(true);
    }

    fn apply_groups(
        &mut self,
        groups: &[String],
        decls: &BTreeMap<String, GroupDecl>,
        layer: &DefinitionLayer,
    ) {
        for (name, group) in decls {
            let mut path = groups.to_vec();
            path.push(name.clone());
            if let Some(raw) = group.raw {
                self.group_raw.insert(path.join("."), raw);
            }
            self.apply_vars(&path, &group.vars, layer);
            self.apply_groups(&path, &group.groups, layer);
        }
    }

    /// Merges one layer's declarations into the leaves, field by field.
    fn apply_vars(&mut self, groups: &[String], decls: &BTreeMap<String, VarDecl>, layer: &DefinitionLayer) {
        for (name, decl) in decls {
            let leaf = self.tree.entry(groups, name, &layer.path);
            leaf.origin = layer.path.clone();
            if let Some(ty) = &decl.ty {
                leaf.type_decl = Some(ty.clone());
            }
            if let Some(value) = &decl.value {
                leaf.value = Some(Value::from(value.clone()));
            }
            if let Some(optional) = decl.optional {
                leaf.optional = optional;
            }
            if let Some(compute) = &decl.compute {
                leaf.compute = Some(compute.clone());
            }
            let relative = leaf.relative_name();

            let pending = self.pending.entry(relative).or_default();
            if decl.raw.is_some() {
                pending.raw = decl.raw;
            }
            if decl.default.is_some() {
                pending.default = decl.default.clone();
            }
            if let Some(factory) = &decl.default_factory {
                pending.default_factory = Some((factory.clone(), layer.path.clone()));
            }
            if let Some(setter) = &decl.setter {
                pending.setter = Some((setter.clone(), layer.path.clone()));
            }
        }
    }

    fn register_magic(&mut self, layer: &DefinitionLayer) -> Result<(), MagicError> {
        for (name, decl) in &layer.file.commands {
            self.magic.register(magic::command_from_decl(name, decl, &layer.path)?);
        }
        for (name, decl) in &layer.file.contexts {
            self.magic.register(magic::context_from_decl(name, decl, &layer.path)?);
        }
        for (name, decl) in &layer.file.hooks {
            self.magic.register(magic::hook_from_decl(name, decl, &layer.path)?);
        }
        for (index, line) in layer.file.env.boot_code.iter().enumerate() {
            let mut function = magic::boot_code(index, line, &layer.path)?;
            // Boot code accumulates across layers.
            function.namespace = Some(layer.path.to_string_lossy().to_string());
            self.magic.register(function);
        }
        Ok(())
    }

    /// `path` = every layer's `path_prepend` (child layers first) followed by
    /// the process `PATH`, unless a layer set `path` explicitly.
    fn finish_path(&mut self, layers: &[DefinitionLayer], process_env: &ProcessEnv) {
        let Some(leaf) = self.tree.find_mut("path") else {
            return;
        };
        if leaf.value.is_some() {
            return;
        }
        let mut entries: Vec<String> = layers
            .iter()
            .rev()
            .flat_map(|l| l.file.env.path_prepend.iter().map(|p| expand_path(p, &l.root)))
            .collect();
        entries.extend(split_path_var(process_env.get("PATH")));
        leaf.value = Some(Value::list(unique(entries).into_iter().map(Value::Str).collect()));
    }

    /// Resolves `raw` inheritance, defaults and setters once every layer is in.
    fn finish_leaves(&mut self) -> Result<(), ComposeError> {
        let scope = Arc::clone(self.tree.scope());
        let host = self.tree.host().cloned();
        let names: Vec<String> = self.tree.leaves().map(|l| l.relative_name()).collect();

        for relative in names {
            let pending = self.pending.remove(&relative).unwrap_or_default();
            let raw = pending.raw.unwrap_or_else(|| self.inherited_raw(&relative));
            let Some(leaf) = self.tree.find_mut(&relative) else {
                continue;
            };
            leaf.raw = raw;

            if leaf.value.is_none() {
                if let Some(default) = pending.default {
                    leaf.value = Some(Value::from(default));
                } else if let Some((factory, origin)) = &pending.default_factory {
                    let location = format!("{}:[{}.default_factory]", origin.display(), relative);
                    leaf.value = Some(evaluate(factory, &location, &scope, &host, None)?);
                }
            }

            if let (Some((setter, origin)), Some(value)) = (&pending.setter, leaf.value.clone()) {
                let location = format!("{}:[{}.setter]", origin.display(), relative);
                leaf.value = Some(evaluate(setter, &location, &scope, &host, Some(value))?);
            }
        }
        Ok(())
    }

    /// `raw` of the nearest enclosing group that sets it.
    fn inherited_raw(&self, relative: &str) -> bool {
        let mut parts: Vec<&str> = relative.split('.').collect();
        parts.pop();
        while !parts.is_empty() {
            if let Some(raw) = self.group_raw.get(&parts.join(".")) {
                return *raw;
            }
            parts.pop();
        }
        false
    }
}

fn evaluate(
    source: &str,
    location: &str,
    scope: &Arc<ModuleObj>,
    host: &Option<Arc<ScriptHost>>,
    value: Option<Value>,
) -> Result<Value, ComposeError> {
    let to_error = |source| ComposeError::Script {
        location: location.to_string(),
        source,
    };
    let expr = parser::parse_expr(source, location).map_err(to_error)?;
    let mut scope = Scope::new(Some(Arc::clone(scope))).with_host(host.clone());
    if let Some(value) = value {
        scope.bind("value", value);
    }
    interp::eval(&expr, &scope).map_err(to_error)
}

fn watch_roots(layers: &[DefinitionLayer], sources: &[PathBuf]) -> Vec<WatchRoot> {
    let mut roots: Vec<WatchRoot> = Vec::new();

    for layer in layers.iter().filter(|l| l.path.is_file()) {
        let mut include = vec![DEFINITION_GLOB.to_string()];
        if let Some(file_name) = layer.path.file_name() {
            include.push(file_name.to_string_lossy().to_string());
        }
        include.extend(layer.file.env.watch.iter().cloned());
        let mut exclude = default_excludes();
        exclude.extend(layer.file.env.ignore.iter().cloned());
        merge_root(&mut roots, layer.root.clone(), WatchKind::Definition, include, exclude);
    }

    for source in sources {
        merge_root(
            &mut roots,
            source.clone(),
            WatchKind::Sources,
            vec![SOURCES_GLOB.to_string()],
            default_excludes(),
        );
    }
    roots
}

fn merge_root(
    roots: &mut Vec<WatchRoot>,
    path: PathBuf,
    kind: WatchKind,
    include: Vec<String>,
    exclude: Vec<String>,
) {
    match roots.iter_mut().find(|r| r.path == path && r.kind == kind) {
        Some(existing) => {
            for glob in include {
                if !existing.include.contains(&glob) {
                    existing.include.push(glob);
                }
            }
            for glob in exclude {
                if !existing.exclude.contains(&glob) {
                    existing.exclude.push(glob);
                }
            }
        }
        None => roots.push(WatchRoot {
            path,
            kind,
            include,
            exclude,
        }),
    }
}

fn default_excludes() -> Vec<String> {
    DEFAULT_EXCLUDES.iter().map(|g| g.to_string()).collect()
}

fn default_env_name(root: &Path) -> String {
    root.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "env".to_string())
}

fn split_path_var(value: Option<&str>) -> Vec<String> {
    value
        .map(|v| {
            std::env::split_paths(v)
                .map(|p| p.to_string_lossy().to_string())
                .filter(|p| !p.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn unique<T: PartialEq>(items: Vec<T>) -> Vec<T> {
    let mut out: Vec<T> = Vec::with_capacity(items.len());
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}
